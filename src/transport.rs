//! The boundary between this crate and the network.
//!
//! Framing, OpenWire marshalling and the actual socket live on the other
//! side of [`Transport`]. Everything in this crate talks to a connection
//! only through `oneway`/`sync_request`, and only learns about inbound
//! traffic by registering a [`Dispatcher`] — it never owns a socket or a
//! read loop itself.

use std::{sync::Arc, time::Duration};

use crate::{
    command::{Command, MessageDispatch},
    ids::ConsumerId,
    Result,
};

/// Sends commands to, and receives commands from, a broker connection.
///
/// Implementations are expected to be cheap to clone (an `Arc` around the
/// real connection is typical) since every `Session`, `MessageConsumer` and
/// `MessageProducer` holds one.
pub trait Transport: Send + Sync {
    /// Fire-and-forget send; used for anything the caller does not need to
    /// block on (message sends under a producer window, acks, pulls).
    fn oneway(&self, command: Command) -> Result<()>;

    /// Send a command and wait for the broker's reply, optionally bounded
    /// by `timeout`. Used for anything whose success the caller must know
    /// before proceeding (consumer/producer/session creation, commit,
    /// rollback).
    fn sync_request(&self, command: Command, timeout: Option<Duration>) -> Result<Command>;

    /// Register the callback that inbound `MessageDispatch`es and
    /// transport-interruption notifications are routed through for a given
    /// consumer. Implementations route by `ConsumerId` rather than handing
    /// back a channel, since a session's executor owns the dispatch loop
    /// and needs a uniform entry point for every consumer it manages.
    fn add_dispatcher(&self, consumer_id: ConsumerId, dispatcher: Arc<dyn Dispatcher>);

    /// Undo a previous `add_dispatcher`; called when a consumer closes.
    fn remove_dispatcher(&self, consumer_id: &ConsumerId);
}

/// Callback surface a `Transport` drives as it receives traffic for one
/// consumer.
pub trait Dispatcher: Send + Sync {
    /// A message arrived for this consumer.
    fn dispatch(&self, dispatch: MessageDispatch);

    /// The transport has lost its connection. Messages already in flight
    /// for this consumer may need to be cleared and redelivered once the
    /// connection resumes; see the consumer's transport-interrupt handling.
    fn on_transport_interrupted(&self) {}

    /// The transport has re-established its connection.
    fn on_transport_resumed(&self) {}
}

#[cfg(test)]
pub mod support {
    //! An in-memory `Transport` double used across this crate's tests.

    use std::sync::Mutex;

    use super::*;
    use crate::Error;

    /// Records every command sent and replays a scripted response queue for
    /// `sync_request`. Never touches a real socket.
    #[derive(Default)]
    pub struct RecordingTransport {
        sent:       Mutex<Vec<Command>>,
        responses:  Mutex<Vec<Command>>,
        dispatchers: Mutex<Vec<(ConsumerId, Arc<dyn Dispatcher>)>>,
        fail_next_sync: Mutex<Option<String>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self { Self::default() }

        /// Queue a response `sync_request` will hand back, FIFO.
        pub fn push_response(&self, command: Command) {
            self.responses.lock().unwrap().push(command);
        }

        /// The next `sync_request` call fails with `Error::BrokerRejection`
        /// instead of consuming the response queue; used to test rollback of
        /// partial registration (consumer/producer creation) on rejection.
        pub fn fail_next_sync(&self, message: impl Into<String>) {
            *self.fail_next_sync.lock().unwrap() = Some(message.into());
        }

        pub fn sent(&self) -> Vec<Command> {
            self.sent.lock().unwrap().iter().cloned().collect::<Vec<_>>()
        }

        pub fn sent_count(&self) -> usize { self.sent.lock().unwrap().len() }

        /// Deliver `dispatch` to whichever dispatcher is registered for its
        /// consumer, as a real transport would on an inbound frame.
        pub fn deliver(&self, dispatch: MessageDispatch) {
            let dispatchers = self.dispatchers.lock().unwrap();
            if let Some((_, dispatcher)) =
                dispatchers.iter().find(|(id, _)| *id == dispatch.consumer_id)
            {
                dispatcher.dispatch(dispatch);
            }
        }
    }

    impl Transport for RecordingTransport {
        fn oneway(&self, command: Command) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn sync_request(&self, command: Command, _timeout: Option<Duration>) -> Result<Command> {
            self.sent.lock().unwrap().push(command);
            if let Some(message) = self.fail_next_sync.lock().unwrap().take() {
                return Err(Error::BrokerRejection(message));
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Command::Response)
            } else {
                Ok(responses.remove(0))
            }
        }

        fn add_dispatcher(&self, consumer_id: ConsumerId, dispatcher: Arc<dyn Dispatcher>) {
            self.dispatchers.lock().unwrap().push((consumer_id, dispatcher));
        }

        fn remove_dispatcher(&self, consumer_id: &ConsumerId) {
            self.dispatchers.lock().unwrap().retain(|(id, _)| id != consumer_id);
        }
    }
}
