use serde::{Deserialize, Serialize};

/// The routing behaviors an exchange can have.
///
/// - `Direct`: a binding matches iff its pattern equals the routing key
///   byte-for-byte.
/// - `Fanout`: every binding matches, patterns and keys are ignored.
/// - `Topic`: patterns are `.`-separated words with `*` (exactly one word)
///   and `#` (zero or more words) wildcards.
///
/// Headers exchanges are intentionally not modeled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Topic => write!(f, "topic"),
        }
    }
}

/// Declaration options for an exchange.
///
/// `durable` is a pass-through hint for the persistence collaborator; the
/// routing core itself never acts on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    pub durable: bool,
}

impl ExchangeOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// A rule associating an exchange with a queue via a routing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

/// An exchange: a named set of bindings with one routing behavior.
///
/// Bindings keep insertion order so delivery order across queues is
/// deterministic; duplicate (queue, pattern) pairs are rejected on insert,
/// which makes re-binding idempotent.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub opts: ExchangeOptions,
    pub(crate) bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind, opts: ExchangeOptions) -> Self {
        Self {
            name: name.to_string(),
            kind,
            opts,
            bindings: Vec::new(),
        }
    }

    /// Inserts a binding, returning whether it was newly added.
    pub(crate) fn bind(&mut self, queue: &str, pattern: &str) -> bool {
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if self.bindings.contains(&binding) {
            return false;
        }
        self.bindings.push(binding);
        true
    }

    /// Removes a binding, returning whether it was present.
    pub(crate) fn unbind(&mut self, queue: &str, pattern: &str) -> bool {
        let before = self.bindings.len();
        self.bindings
            .retain(|b| !(b.queue == queue && b.pattern == pattern));
        self.bindings.len() != before
    }

    /// Drops every binding that references `queue`.
    pub(crate) fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}
