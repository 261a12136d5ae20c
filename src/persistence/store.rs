//! The durability seam between the routing core and storage.
//!
//! The broker notifies a [`Store`] of every durable structural mutation and
//! of every message entering or leaving a durable queue. Implementations
//! are best-effort: they log their own failures and never surface them into
//! broker results, so the in-memory registry stays the source of truth.

use serde::{Deserialize, Serialize};

use crate::broker::exchange::{ExchangeKind, ExchangeOptions};
use crate::broker::message::Message;
use crate::broker::queue::QueueOptions;

/// A durable exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredExchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub opts: ExchangeOptions,
}

/// A durable queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredQueue {
    pub name: String,
    pub opts: QueueOptions,
}

/// A binding between a durable exchange and a durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBinding {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
}

/// The durable topology recorded by a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    pub exchanges: Vec<StoredExchange>,
    pub queues: Vec<StoredQueue>,
    pub bindings: Vec<StoredBinding>,
}

/// Storage collaborator for durable topology and backlogs.
pub trait Store: Send + Sync {
    fn save_exchange(&self, exchange: &StoredExchange);

    /// Forgets an exchange and any stored bindings that reference it.
    fn remove_exchange(&self, name: &str);

    fn save_queue(&self, queue: &StoredQueue);

    /// Forgets a queue along with its stored bindings and messages.
    fn remove_queue(&self, name: &str);

    fn save_binding(&self, binding: &StoredBinding);

    fn remove_binding(&self, binding: &StoredBinding);

    /// Records a message resident in `queue`. Called before the in-memory
    /// enqueue so a consumer can never settle a message that was not yet
    /// recorded.
    fn save_message(&self, queue: &str, message: &Message);

    /// Forgets a message once it leaves `queue` for good (ack, auto-mode
    /// delivery, discard, or an enqueue rolled back on overflow).
    fn remove_message(&self, queue: &str, message: &Message);

    /// Loads the durable topology recorded by a previous run.
    fn load_state(&self) -> StoredState;

    /// Loads the stored messages of one queue, oldest first.
    fn load_messages(&self, queue: &str) -> Vec<Message>;
}

/// Discards every notification. The default when persistence is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl Store for NoopStore {
    fn save_exchange(&self, _exchange: &StoredExchange) {}

    fn remove_exchange(&self, _name: &str) {}

    fn save_queue(&self, _queue: &StoredQueue) {}

    fn remove_queue(&self, _name: &str) {}

    fn save_binding(&self, _binding: &StoredBinding) {}

    fn remove_binding(&self, _binding: &StoredBinding) {}

    fn save_message(&self, _queue: &str, _message: &Message) {}

    fn remove_message(&self, _queue: &str, _message: &Message) {}

    fn load_state(&self) -> StoredState {
        StoredState::default()
    }

    fn load_messages(&self, _queue: &str) -> Vec<Message> {
        Vec::new()
    }
}
