//! Broker commands exchanged between the client runtime and the broker.
//!
//! The wire encoding of these commands (OpenWire marshalling) is out of
//! scope: this module only carries the semantic shape the core needs to
//! build, route and log them. A real deployment plugs a codec underneath
//! `Transport` that turns a `Command` into bytes; this crate never does
//! that itself.

use std::fmt;

use chrono::{DateTime, Utc};
use num_derive::FromPrimitive;

use crate::ids::{ConnectionId, ConsumerId, MessageId, ProducerId, TransactionId};

/// A destination name plus kind. The physical addressing scheme (queue vs.
/// topic vs. temporary, composite destinations, ...) is carried as an opaque
/// string pair since the wire-level destination grammar is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub physical_name: String,
    pub is_topic:      bool,
    pub is_temporary:  bool,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self { physical_name: name.into(), is_topic: false, is_temporary: false }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self { physical_name: name.into(), is_topic: true, is_temporary: false }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.physical_name) }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id:     Option<String>,
    pub user_name:     Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: crate::ids::SessionId,
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub consumer_id:        ConsumerId,
    pub destination:        Destination,
    pub subscription_name:  Option<String>,
    pub selector:           Option<String>,
    pub prefetch_size:      u32,
    pub maximum_pending:    Option<u32>,
    pub no_local:           bool,
    pub browser:            bool,
    pub dispatch_async:     bool,
    pub priority:           i8,
}

#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub producer_id:       ProducerId,
    pub destination:       Option<Destination>,
    pub window_size:       Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DestinationInfo {
    pub connection_id: ConnectionId,
    pub destination:   Destination,
}

/// Object teardown: identifies what's being removed and the last sequence
/// id the owner had actually delivered.
#[derive(Debug, Clone)]
pub struct RemoveInfo {
    pub object_id:                 ObjectId,
    pub last_delivered_sequence_id: i64,
}

/// The union of ids that can be torn down with a `RemoveInfo`.
#[derive(Debug, Clone, derive_more::From)]
pub enum ObjectId {
    Connection(ConnectionId),
    Session(crate::ids::SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Connection(id) => write!(f, "{id}"),
            ObjectId::Session(id) => write!(f, "{id}"),
            ObjectId::Consumer(id) => write!(f, "{id}"),
            ObjectId::Producer(id) => write!(f, "{id}"),
        }
    }
}

/// An application message plus the delivery metadata the consumer runtime
/// needs (transaction membership, persistence, priority, expiration).
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id:    MessageId,
    pub destination:   Destination,
    pub transaction_id: Option<TransactionId>,
    pub persistent:    bool,
    pub priority:      u8,
    pub expiration:    Option<DateTime<Utc>>,
    pub redelivery_counter: u32,
    pub redelivered:   bool,
    /// Opaque application payload; body codecs are out of scope (§1).
    pub body: Vec<u8>,
}

impl Message {
    /// Default JMS priority, used by the priority dispatch channel when a
    /// message carries none.
    pub const DEFAULT_PRIORITY: u8 = 4;

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(false, |exp| exp <= now)
    }

    /// Bump the redelivery counter and flag the message as redelivered,
    /// applied to every message pushed back into a consumer on rollback.
    pub fn on_message_rollback(&mut self) {
        self.redelivery_counter += 1;
        self.redelivered = true;
    }
}

/// A dispatch of one message to one consumer, inbound from the broker.
#[derive(Debug, Clone)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    /// `None` is always a channel-close sentinel, never "a real message may
    /// follow" — a consumer sees this as the signal to stop dequeuing.
    pub message:     Option<Message>,
    pub redelivery_counter: u32,
}

impl MessageDispatch {
    pub const fn is_close_sentinel(&self) -> bool { self.message.is_none() }
}

/// What kind of acknowledgement a `MessageAck` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum_macros::Display)]
#[repr(i32)]
pub enum AckType {
    Delivered   = 0,
    Poison      = 1,
    Consumed    = 2,
    Redelivered = 3,
    Individual  = 4,
}

#[derive(Debug, Clone)]
pub struct MessageAck {
    pub ack_type:        AckType,
    pub consumer_id:     ConsumerId,
    pub destination:     Destination,
    pub first_message_id: MessageId,
    pub last_message_id:  MessageId,
    pub message_count:    u32,
    pub transaction_id:   Option<TransactionId>,
}

/// A broker-side pull request issued by a zero-prefetch consumer.
///
/// `timeout` semantics: `Some(0)` = wait indefinitely for one message,
/// `Some(n)` = wait up to `n`, `None` = don't wait (return immediately).
#[derive(Debug, Clone)]
pub struct MessagePull {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub timeout:     Option<std::time::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum_macros::Display)]
#[repr(i32)]
pub enum TransactionType {
    Begin            = 0,
    Prepare          = 1,
    CommitOnePhase   = 2,
    CommitTwoPhase   = 3,
    Rollback         = 4,
    Recover          = 5,
    Forget           = 6,
    End              = 7,
}

#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
}

#[derive(Debug, Clone)]
pub struct RemoveSubscriptionInfo {
    pub connection_id: ConnectionId,
    pub client_id:     String,
    pub subscription_name: String,
}

/// The union of everything exchanged with the broker. `Transport::oneway`
/// and `Transport::sync_request` both operate in terms of this enum; a
/// concrete transport decides how to (de)serialize each variant.
#[derive(Debug, Clone, derive_more::From)]
pub enum Command {
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    DestinationInfo(DestinationInfo),
    RemoveInfo(RemoveInfo),
    MessageDispatch(MessageDispatch),
    Message(Message),
    MessageAck(MessageAck),
    MessagePull(MessagePull),
    TransactionInfo(TransactionInfo),
    RemoveSubscriptionInfo(RemoveSubscriptionInfo),
    /// A synchronous broker reply carrying nothing but success/failure;
    /// mirrors the teacher's bare `IBFrame::OrderId`-style acks where the
    /// payload is just an acknowledgement.
    Response,
}
