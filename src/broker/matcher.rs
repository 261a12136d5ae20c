//! Routing-key matching for the three exchange kinds.
//!
//! Direct matching is byte equality, fanout matches everything, and topic
//! matching walks `.`-separated words with two wildcards: `*` consumes
//! exactly one word, `#` consumes zero or more consecutive words. `#` is
//! expanded shortest-first, so `inform.#.email.#` accepts `inform.email`
//! as well as `inform.urgent.email.now`.
//!
//! Matching is case-sensitive and never trims whitespace. The empty string
//! splits into zero words, which means `#` matches the empty routing key
//! while `*` and literals do not.

use crate::broker::exchange::{Binding, ExchangeKind};

/// Returns the queues selected by `bindings` for `routing_key`, in binding
/// order and with duplicates removed (a queue bound twice with matching
/// patterns still receives one copy).
pub(crate) fn select_queues<'b>(
    kind: ExchangeKind,
    bindings: &'b [Binding],
    routing_key: &str,
) -> Vec<&'b str> {
    let mut selected: Vec<&str> = Vec::new();
    for binding in bindings {
        let hit = match kind {
            ExchangeKind::Direct => binding.pattern == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
        };
        if hit && !selected.contains(&binding.queue.as_str()) {
            selected.push(&binding.queue);
        }
    }
    selected
}

/// Whether a topic pattern accepts a routing key.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_words = split_words(pattern);
    let key_words = split_words(routing_key);
    match_words(&pattern_words, &key_words)
}

fn split_words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

/// Consumes `pattern` against `key` word by word; both must be exhausted
/// simultaneously for a match.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Zero or more words: try every split point, shortest first.
            (0..=key.len()).any(|taken| match_words(rest, &key[taken..]))
        }
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => match_words(rest, key_rest),
            None => false,
        },
        Some((&word, rest)) => match key.split_first() {
            Some((&head, key_rest)) if head == word => match_words(rest, key_rest),
            _ => false,
        },
    }
}
