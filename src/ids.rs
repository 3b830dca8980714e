//! Broker-visible identifiers.
//!
//! `ConnectionId` is the root; every other id embeds it so that a session,
//! consumer or producer id is globally unique without a central allocator.

use std::fmt;

/// Globally unique connection identifier, assigned by the client at connect
/// time (typically a UUID string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self { ConnectionId(value) }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self { ConnectionId(value.to_string()) }
}

/// `SessionId = (ConnectionId, long)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub connection_id: ConnectionId,
    pub value:          i64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

impl SessionId {
    pub const fn new(connection_id: ConnectionId, value: i64) -> Self {
        Self { connection_id, value }
    }

    /// The id-suffix `-1` default session created with every `ConnectionState`.
    pub fn default_for(connection_id: ConnectionId) -> Self { Self::new(connection_id, -1) }
}

/// `ConsumerId = (ConnectionId, long session, long value)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId {
    pub session_id: SessionId,
    pub value:      i64,
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

impl ConsumerId {
    pub const fn new(session_id: SessionId, value: i64) -> Self { Self { session_id, value } }
}

/// `ProducerId`, structurally identical to `ConsumerId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId {
    pub session_id: SessionId,
    pub value:      i64,
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

impl ProducerId {
    pub const fn new(session_id: SessionId, value: i64) -> Self { Self { session_id, value } }
}

/// `MessageId = (ProducerId, long sequence)` plus a broker-assigned
/// `BrokerSequenceId`, filled in once the broker has accepted the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub producer_id:        ProducerId,
    pub producer_sequence:  i64,
    pub broker_sequence_id: Option<BrokerSequenceId>,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence)
    }
}

impl MessageId {
    pub const fn new(producer_id: ProducerId, producer_sequence: i64) -> Self {
        Self { producer_id, producer_sequence, broker_sequence_id: None }
    }
}

/// Broker-assigned total order for a message, independent of the producer
/// that sent it; stays monotonically non-decreasing across redeliveries
/// within the same transaction, only resetting when the broker says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BrokerSequenceId(pub i64);

/// Opaque transaction identifier minted by the transaction coordinator.
/// Treated as an external collaborator value: this crate never constructs
/// one's internal shape, only round-trips what `Begin()` receives from (or,
/// in this in-process model, generates for) the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Client-assigned identifier for a request/response correlation (not a
/// broker-visible id; used only between `Session`/`MessageConsumer` and the
/// `Transport`'s synchronous request path).
pub type RequestId = usize;
