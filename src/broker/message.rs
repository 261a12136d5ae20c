use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A published message as it travels through the routing core.
///
/// The payload is opaque bytes; the routing key is only consulted at
/// publish time. Once a message sits in a queue backlog it carries no
/// memory of the exchange it arrived through.
///
/// Serialization to and from JSON is used by the persistence collaborator;
/// nothing on the hot path serializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id assigned at publish time (UUID v4).
    pub message_id: String,
    /// Routing key the producer attached, possibly empty.
    pub routing_key: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Publish timestamp, Unix epoch milliseconds.
    pub timestamp: i64,
}

impl Message {
    /// Builds a message with a fresh id and the current timestamp.
    pub fn new(routing_key: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Whether a consume discharges the message immediately or leaves it
/// in flight until an explicit ack/nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The FIFO pop is the acknowledgment.
    Auto,
    /// The delivery stays in the queue's in-flight map under a delivery
    /// tag until acked, nacked, or recovered.
    Manual,
}

/// What a consumer receives from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The delivered message, shared with any other queue it was routed to.
    pub message: Arc<Message>,
    /// The queue this delivery came from.
    pub queue: String,
    /// In-flight tag, present only under [`AckMode::Manual`].
    pub delivery_tag: Option<u64>,
    /// How many times this envelope was returned to the backlog by a
    /// nack or a recover before this delivery.
    pub redeliveries: u32,
}
