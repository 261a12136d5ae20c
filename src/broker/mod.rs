//! The `broker` module contains the routing core: the exchange and queue
//! registry, the routing-key matcher, and FIFO queues with blocking
//! consumption and manual acknowledgment.

pub mod engine;
pub mod exchange;
pub mod matcher;
pub mod message;
pub mod queue;

pub use engine::{Broker, BrokerStats};
pub use exchange::{Binding, ExchangeKind, ExchangeOptions};
pub use message::{AckMode, Delivery, Message};
pub use queue::QueueOptions;
