//! The `error` module defines the error types used within the `switchyard`
//! routing core.
//!
//! Every structural operation surfaces its failure synchronously through
//! [`BrokerError`]; nothing is retried internally. `Empty` is a normal
//! outcome of a non-blocking or timed-out consume, carried here so callers
//! get the `try_recv`-style `Result` shape.

use thiserror::Error;

use crate::broker::ExchangeKind;

/// Errors returned by the routing core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// An exchange or queue name failed validation (for example, empty).
    #[error("invalid name `{0}`")]
    InvalidName(String),

    /// The default (nameless) exchange cannot be declared, bound, or deleted.
    #[error("the default exchange is reserved and cannot be modified")]
    ReservedExchange,

    /// An exchange was re-declared with a different kind.
    #[error("exchange `{name}` already declared as {existing}, not {requested}")]
    ExchangeKindMismatch {
        name: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },

    /// An exchange was re-declared with different options.
    #[error("exchange `{0}` already declared with different options")]
    ExchangeOptionsMismatch(String),

    /// A queue was re-declared with different options.
    #[error("queue `{0}` already declared with different options")]
    QueueOptionsMismatch(String),

    /// An operation referenced an exchange that was never declared.
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// An operation referenced a queue that was never declared.
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// An ack or nack referenced a delivery tag with no in-flight entry.
    #[error("no in-flight delivery with tag {tag} on queue `{queue}`")]
    UnknownDelivery { queue: String, tag: u64 },

    /// A non-blocking or timed-out consume found no pending message.
    ///
    /// Not a failure, just the empty outcome.
    #[error("queue is empty")]
    Empty,

    /// A publish would push a queue past its configured maximum length.
    #[error("queue `{0}` is at capacity")]
    CapacityExceeded(String),
}
