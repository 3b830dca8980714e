#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! A JMS-style session and consumer runtime for an ActiveMQ OpenWire client.
//!
//! This crate implements the parts of a broker client that sit above the
//! wire: per-connection state tracking, session-scoped dispatch, the five
//! acknowledgement modes, and local transaction coordination. Marshalling
//! OpenWire frames onto a socket is someone else's job — this crate talks to
//! the network only through the [`Transport`] trait.

pub mod command;
pub mod consumer;
pub mod dispatch_channel;
pub mod error;
mod executor;
pub mod ids;
pub mod producer;
pub mod redelivery;
pub mod session;
pub mod state;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod uri;

pub use error::{Error, Result};

/// Re-exports the types most callers need to build a session against a
/// broker connection.
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        command::{
            AckType, Command, ConnectionInfo, ConsumerInfo, Destination, Message, MessageAck,
            MessageDispatch, MessagePull, ObjectId, ProducerInfo, RemoveInfo,
            RemoveSubscriptionInfo, SessionInfo, TransactionInfo, TransactionType,
        },
        consumer::{AcknowledgementMode, MessageConsumer, MessageListener},
        ids::{
            BrokerSequenceId, ConnectionId, ConsumerId, MessageId, ProducerId, RequestId,
            SessionId, TransactionId,
        },
        producer::MessageProducer,
        redelivery::RedeliveryPolicy,
        session::Session,
        transport::Transport,
        Error, Result,
    };
}
