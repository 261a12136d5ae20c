//! Sled-backed [`Store`].
//!
//! Topology records live in a single tree as JSON values under kind-prefixed
//! keys (`exchange:…`, `queue:…`, `binding:…`). Each queue's resident
//! messages live in their own tree, keyed by the big-endian publish
//! timestamp followed by the message id, so iteration order is the arrival
//! order and same-millisecond publishes never clobber each other.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use tracing::{error, warn};

use crate::broker::message::Message;
use crate::persistence::store::{
    Store, StoredBinding, StoredExchange, StoredQueue, StoredState,
};

const TOPOLOGY_TREE: &str = "topology";
const EXCHANGE_PREFIX: &str = "exchange:";
const QUEUE_PREFIX: &str = "queue:";
const BINDING_PREFIX: &str = "binding:";
const MESSAGES_PREFIX: &str = "messages:";

/// Binding key segments are NUL-joined; names are validated NUL-free.
const SEP: char = '\u{0}';

#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Opens (or creates) a store rooted at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> sled::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Flushes dirty pages to disk. Sled also flushes in the background and
    /// on drop; this is for callers that need a hard durability point.
    pub fn flush(&self) {
        if let Err(e) = self.db.flush() {
            error!("Failed to flush store: {}", e);
        }
    }

    fn tree(&self, name: &str) -> Option<Tree> {
        match self.db.open_tree(name) {
            Ok(tree) => Some(tree),
            Err(e) => {
                error!("Failed to open tree {}: {}", name, e);
                None
            }
        }
    }

    fn topology(&self) -> Option<Tree> {
        self.tree(TOPOLOGY_TREE)
    }

    fn insert_json<T: Serialize>(&self, tree: &Tree, key: impl AsRef<[u8]>, value: &T) {
        let serialized = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize record: {:?}", e);
                return;
            }
        };
        if let Err(e) = tree.insert(key.as_ref(), serialized) {
            error!("Failed to write record: {}", e);
        }
    }

    fn remove_key(&self, tree: &Tree, key: impl AsRef<[u8]>) {
        if let Err(e) = tree.remove(key.as_ref()) {
            error!("Failed to remove record: {}", e);
        }
    }

    fn decode<T: DeserializeOwned>(value: &[u8]) -> Option<T> {
        match serde_json::from_slice(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping corrupt record: {}", e);
                None
            }
        }
    }
}

fn exchange_key(name: &str) -> String {
    format!("{EXCHANGE_PREFIX}{name}")
}

fn queue_key(name: &str) -> String {
    format!("{QUEUE_PREFIX}{name}")
}

fn binding_key(exchange: &str, queue: &str, pattern: &str) -> String {
    format!("{BINDING_PREFIX}{exchange}{SEP}{queue}{SEP}{pattern}")
}

fn messages_tree_name(queue: &str) -> String {
    format!("{MESSAGES_PREFIX}{queue}")
}

fn message_key(message: &Message) -> Vec<u8> {
    let mut key = message.timestamp.to_be_bytes().to_vec();
    key.extend_from_slice(message.message_id.as_bytes());
    key
}

impl Store for SledStore {
    fn save_exchange(&self, exchange: &StoredExchange) {
        if let Some(tree) = self.topology() {
            self.insert_json(&tree, exchange_key(&exchange.name), exchange);
        }
    }

    fn remove_exchange(&self, name: &str) {
        let Some(tree) = self.topology() else { return };
        self.remove_key(&tree, exchange_key(name));
        // Bindings key on exchange first, so one prefix scan finds them all.
        let prefix = format!("{BINDING_PREFIX}{name}{SEP}");
        let keys: Vec<_> = tree
            .scan_prefix(prefix.as_bytes())
            .filter_map(|res| res.ok())
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.remove_key(&tree, key);
        }
    }

    fn save_queue(&self, queue: &StoredQueue) {
        if let Some(tree) = self.topology() {
            self.insert_json(&tree, queue_key(&queue.name), queue);
        }
    }

    fn remove_queue(&self, name: &str) {
        if let Some(tree) = self.topology() {
            self.remove_key(&tree, queue_key(name));
            let stale: Vec<_> = tree
                .scan_prefix(BINDING_PREFIX.as_bytes())
                .filter_map(|res| res.ok())
                .filter(|(_, value)| {
                    Self::decode::<StoredBinding>(value)
                        .is_some_and(|binding| binding.queue == name)
                })
                .map(|(key, _)| key)
                .collect();
            for key in stale {
                self.remove_key(&tree, key);
            }
        }
        if let Err(e) = self.db.drop_tree(messages_tree_name(name)) {
            error!("Failed to drop message tree for {}: {}", name, e);
        }
    }

    fn save_binding(&self, binding: &StoredBinding) {
        if let Some(tree) = self.topology() {
            let key = binding_key(&binding.exchange, &binding.queue, &binding.pattern);
            self.insert_json(&tree, key, binding);
        }
    }

    fn remove_binding(&self, binding: &StoredBinding) {
        if let Some(tree) = self.topology() {
            let key = binding_key(&binding.exchange, &binding.queue, &binding.pattern);
            self.remove_key(&tree, key);
        }
    }

    fn save_message(&self, queue: &str, message: &Message) {
        if let Some(tree) = self.tree(&messages_tree_name(queue)) {
            self.insert_json(&tree, message_key(message), message);
        }
    }

    fn remove_message(&self, queue: &str, message: &Message) {
        if let Some(tree) = self.tree(&messages_tree_name(queue)) {
            self.remove_key(&tree, message_key(message));
        }
    }

    fn load_state(&self) -> StoredState {
        let mut state = StoredState::default();
        let Some(tree) = self.topology() else {
            return state;
        };
        for (key, value) in tree.iter().filter_map(|res| res.ok()) {
            let key = String::from_utf8_lossy(&key);
            if key.starts_with(EXCHANGE_PREFIX) {
                if let Some(record) = Self::decode::<StoredExchange>(&value) {
                    state.exchanges.push(record);
                }
            } else if key.starts_with(QUEUE_PREFIX) {
                if let Some(record) = Self::decode::<StoredQueue>(&value) {
                    state.queues.push(record);
                }
            } else if key.starts_with(BINDING_PREFIX) {
                if let Some(record) = Self::decode::<StoredBinding>(&value) {
                    state.bindings.push(record);
                }
            }
        }
        state
    }

    fn load_messages(&self, queue: &str) -> Vec<Message> {
        let Some(tree) = self.tree(&messages_tree_name(queue)) else {
            return Vec::new();
        };
        tree.iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
            .collect()
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").field("db", &"sled::Db").finish()
    }
}
