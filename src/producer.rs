//! The send path: `MessageId` assignment, the producer-transformer hook,
//! producer-window flow control, and the oneway-vs-sync-request choice.
//!
//! Unlike the teacher's per-request-type modules under `client/` (one file
//! per outbound call, each a thin frame-and-write), a producer here is a
//! single long-lived object the application holds and calls `send` on
//! repeatedly, so the façade is a struct rather than a family of free
//! functions on `Client`.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use tracing::instrument;

use crate::{
    command::{Command, Destination, Message, ProducerInfo},
    ids::{MessageId, ProducerId},
    session::SessionHandle,
    Error, Result,
};

/// Rewrites an outbound message before it is sent; the teacher has no direct
/// analogue (IB Gateway orders are sent as-is), but JMS producers
/// conventionally support this as a pluggable hook rather than requiring
/// callers to pre-transform every message themselves.
pub type ProducerTransformer = Box<dyn Fn(Message) -> Message + Send + Sync>;

/// A JMS-style message producer bound to at most one fixed destination (a
/// producer created with `destination: None` sends to whatever destination
/// each outbound message names).
pub struct MessageProducer {
    producer_id: ProducerId,
    destination: Option<Destination>,
    session: SessionHandle,
    transacted: bool,

    next_sequence: AtomicI64,
    window_size: Option<u32>,
    window_usage: AtomicU32,

    always_sync_send: bool,
    async_send: AtomicBool,
    disable_message_id: AtomicBool,
    disposed: AtomicBool,

    transformer: Mutex<Option<ProducerTransformer>>,
}

impl std::fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProducer")
            .field("producer_id", &self.producer_id)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// Per-send overrides; anything left `None` falls back to a producer default.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub destination: Option<Destination>,
    pub persistent: Option<bool>,
    pub priority: Option<u8>,
    pub time_to_live: Option<Duration>,
    /// `None` = use the producer/connection default strategy. `Some(d)`
    /// forces a synchronous request bounded by `d`; `Some(Duration::ZERO)`
    /// degrades to the fire-and-forget path per the spec's "timeout <= 0"
    /// rule.
    pub send_timeout: Option<Duration>,
}

impl MessageProducer {
    pub(crate) fn new(info: ProducerInfo, session: SessionHandle, transacted: bool) -> Self {
        Self {
            producer_id: info.producer_id,
            destination: info.destination,
            session,
            transacted,
            next_sequence: AtomicI64::new(1),
            window_size: info.window_size,
            window_usage: AtomicU32::new(0),
            always_sync_send: false,
            async_send: AtomicBool::new(false),
            disable_message_id: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            transformer: Mutex::new(None),
        }
    }

    pub fn producer_id(&self) -> &ProducerId { &self.producer_id }

    pub fn destination(&self) -> Option<&Destination> { self.destination.as_ref() }

    /// `AsyncSend`: when set, persistent sends outside a transaction may
    /// still go fire-and-forget (see §4.6's send-strategy table).
    pub fn set_async_send(&self, value: bool) { self.async_send.store(value, Ordering::Relaxed); }

    pub fn set_disable_message_id(&self, value: bool) {
        self.disable_message_id.store(value, Ordering::Relaxed);
    }

    pub fn set_transformer(&self, transformer: impl Fn(Message) -> Message + Send + Sync + 'static) {
        *self.transformer.lock().unwrap() = Some(Box::new(transformer));
    }

    fn next_message_id(&self) -> MessageId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        MessageId::new(self.producer_id.clone(), sequence)
    }

    /// Oneway iff: no positive explicit send timeout, the connection isn't
    /// pinned to always-synchronous sends, and either the message is
    /// non-persistent, async-send is enabled, or we're inside a transaction.
    fn should_send_oneway(&self, persistent: bool, send_timeout: Option<Duration>) -> bool {
        let timeout_forces_sync = matches!(send_timeout, Some(d) if !d.is_zero());
        if timeout_forces_sync || self.always_sync_send {
            return false;
        }
        !persistent || self.async_send.load(Ordering::Relaxed) || self.transacted
    }

    fn exceeds_window(&self, body_len: usize) -> bool {
        match self.window_size {
            Some(window) if window > 0 => {
                self.window_usage.load(Ordering::Relaxed) as usize + body_len > window as usize
            }
            _ => false,
        }
    }

    /// Build, transform and send one message, choosing the send strategy per
    /// §4.6. If the session is transacted, ensures `Begin()` has run and
    /// attaches the resulting transaction id.
    #[instrument(skip(self, body, options))]
    pub fn send(&self, body: Vec<u8>, options: SendOptions) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::producer_closed(&self.producer_id));
        }
        let destination = options
            .destination
            .or_else(|| self.destination.clone())
            .ok_or(Error::InvalidDestination)?;

        let transaction_id = if self.transacted {
            Some(self.session.begin_transaction()?)
        } else {
            None
        };

        let persistent = options.persistent.unwrap_or(true);
        let priority = options.priority.unwrap_or(Message::DEFAULT_PRIORITY);
        let expiration = options.time_to_live.map(|ttl| Utc::now() + ttl);

        let message_id = if self.disable_message_id.load(Ordering::Relaxed) {
            MessageId::new(self.producer_id.clone(), 0)
        } else {
            self.next_message_id()
        };

        let mut message = Message {
            message_id,
            destination: destination.clone(),
            transaction_id,
            persistent,
            priority,
            expiration,
            redelivery_counter: 0,
            redelivered: false,
            body,
        };
        if let Some(transformer) = self.transformer.lock().unwrap().as_ref() {
            message = transformer(message);
        }

        let body_len = message.body.len();
        let oneway = self.should_send_oneway(persistent, options.send_timeout)
            && !self.exceeds_window(body_len);

        if oneway {
            self.session.send_oneway(Command::Message(message))?;
            if self.window_size.is_some() {
                self.window_usage.fetch_add(body_len as u32, Ordering::Relaxed);
            }
            Ok(())
        } else {
            self.session.send_sync(Command::Message(message), options.send_timeout)?;
            self.window_usage.store(0, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Producer teardown. Shutdown is idempotent and, like the consumer's,
    /// doesn't itself talk to the broker — `Session::close` sends the
    /// `RemoveInfo` for every child it owns.
    #[instrument(skip(self))]
    pub fn shutdown(&self) { self.disposed.store(true, Ordering::SeqCst); }

    /// `Close()` on an individual producer: unlike a consumer's, this never
    /// defers to a transaction boundary — a producer carries no unacked
    /// state for a pending commit/rollback to preserve. Removes the producer
    /// from its session and tells the broker with `RemoveInfo`.
    #[instrument(skip(self))]
    pub fn close(&self) {
        self.shutdown();
        self.session.close_producer(&self.producer_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        command::Command,
        ids::{ConnectionId, SessionId},
        transport::support::RecordingTransport,
    };

    fn handle(transport: Arc<RecordingTransport>) -> SessionHandle {
        let session_id = SessionId::new(ConnectionId::from("conn-1"), 1);
        SessionHandle::for_test(session_id, transport)
    }

    fn producer(window_size: Option<u32>, transacted: bool) -> (MessageProducer, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let info = ProducerInfo {
            producer_id: ProducerId::new(SessionId::new(ConnectionId::from("conn-1"), 1), 1),
            destination: Some(Destination::queue("q.out")),
            window_size,
        };
        let producer = MessageProducer::new(info, handle(transport.clone()), transacted);
        (producer, transport)
    }

    #[test]
    fn non_persistent_send_goes_oneway() {
        let (producer, transport) = producer(None, false);
        producer
            .send(vec![1, 2, 3], SendOptions { persistent: Some(false), ..Default::default() })
            .unwrap();
        assert_eq!(transport.sent_count(), 1);
        assert!(matches!(transport.sent()[0], Command::Message(_)));
    }

    #[test]
    fn persistent_send_without_async_goes_sync() {
        let (producer, transport) = producer(None, false);
        producer.send(vec![1], SendOptions { persistent: Some(true), ..Default::default() }).unwrap();
        // still one command sent, but through sync_request rather than oneway;
        // the recording transport doesn't distinguish the two paths in its
        // log, so this asserts the call succeeded without blocking forever.
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn persistent_send_inside_a_transaction_goes_oneway() {
        let (producer, transport) = producer(None, true);
        producer.send(vec![1], SendOptions { persistent: Some(true), ..Default::default() }).unwrap();
        // one TransactionInfo{Begin} plus one Message, both oneway.
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn window_overflow_forces_a_synchronous_send_and_resets_usage() {
        let (producer, _transport) = producer(Some(4), false);
        producer
            .send(vec![0; 4], SendOptions { persistent: Some(false), ..Default::default() })
            .unwrap();
        assert_eq!(producer.window_usage.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn send_without_a_destination_is_invalid() {
        let transport = Arc::new(RecordingTransport::new());
        let info = ProducerInfo {
            producer_id: ProducerId::new(SessionId::new(ConnectionId::from("conn-1"), 1), 1),
            destination: None,
            window_size: None,
        };
        let producer = MessageProducer::new(info, handle(transport), false);
        assert!(matches!(producer.send(vec![], SendOptions::default()), Err(Error::InvalidDestination)));
    }

    #[test]
    fn transformer_runs_before_send() {
        let (producer, transport) = producer(None, false);
        producer.set_transformer(|mut m| {
            m.body.push(99);
            m
        });
        producer
            .send(vec![1], SendOptions { persistent: Some(false), ..Default::default() })
            .unwrap();
        let Command::Message(sent) = &transport.sent()[0] else { panic!("expected a Message command") };
        assert_eq!(sent.body, vec![1, 99]);
    }
}
