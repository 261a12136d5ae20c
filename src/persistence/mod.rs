//! The `persistence` module records durable topology and backlogs so a
//! broker can be rebuilt after a restart.
//!
//! The routing core only notifies a [`Store`]; it never reads from one on
//! the hot path. `SledStore` is the embedded reference implementation,
//! `NoopStore` the default when persistence is disabled.

pub mod sled_store;
pub mod store;

pub use sled_store::SledStore;
pub use store::{NoopStore, Store, StoredBinding, StoredExchange, StoredQueue, StoredState};
