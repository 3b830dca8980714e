//! Crate-wide error type.
//!
//! Unlike the boxed `dyn std::error::Error` used by some broker clients for
//! convenience, every error this crate can produce is enumerable, so callers
//! (in particular the consumer's listener-exception policy) need to match on
//! the kind rather than just print it.

use thiserror::Error;

use crate::ids::{ConsumerId, ProducerId};

/// Errors returned by this crate's session/consumer/producer/transaction
/// runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A consumer or producer was created against a `None` destination.
    #[error("destination must not be null")]
    InvalidDestination,

    /// `commit`/`rollback` called on a non-transacted session, or a
    /// listener was attached to a prefetch-zero consumer.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A mutation was attempted after the owning object (state entry,
    /// consumer, session, ...) was closed or shut down.
    #[error("object closed: {0}")]
    ObjectClosed(String),

    /// The broker rejected a synchronous request (create, ack, commit, ...).
    #[error("broker rejected request: {0}")]
    BrokerRejection(String),

    /// Surfaced asynchronously on consumers/producers/sessions when the
    /// underlying transport has failed. Not raised for transport
    /// interruptions that are recoverable via failover (those are handled
    /// internally, see `Consumer::clear_messages_in_progress`).
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// The configured `Transport` returned an error sending or receiving a
    /// command.
    #[error("transport error: {0}")]
    Transport(String),

    /// A destination URI's query string could not be parsed.
    #[error("invalid destination uri: {0}")]
    InvalidUri(String),

    /// An internal channel (dispatch channel, synchronization bus, ...) had
    /// no receiver left; the owning object has already gone away.
    #[error("disconnected: {0}")]
    Disconnected(String),
}

impl Error {
    pub(crate) fn consumer_closed(id: &ConsumerId) -> Self {
        Error::ObjectClosed(format!("consumer {id} has been closed"))
    }

    pub(crate) fn producer_closed(id: &ProducerId) -> Self {
        Error::ObjectClosed(format!("producer {id} has been closed"))
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
