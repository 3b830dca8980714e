//! The message consumer: prefetch accounting, the dispatch pipeline, and
//! the five acknowledgement modes.
//!
//! This is the largest single component in the crate (see the ack engine in
//! [`ack`]), because it is where every other module's contract actually
//! gets exercised: the dispatch channel, the session executor, the
//! transaction context and the transport all meet here.

mod ack;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{instrument, warn};

use crate::{
    command::{Command, ConsumerInfo, Destination, Message, MessageAck, MessageDispatch, MessagePull},
    dispatch_channel::{DispatchChannel, DispatchQueue, PriorityDispatchChannel},
    executor::DispatchTarget,
    ids::{ConsumerId, MessageId},
    redelivery::RedeliveryPolicy,
    session::SessionHandle,
    transaction::{Synchronization, SynchronizationOwner},
    transport::Dispatcher,
    Error, Result,
};

/// The acknowledgement regime a consumer was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgementMode {
    /// Every delivery is immediately acked as consumed.
    AutoAcknowledgeEach,
    /// `DupsOkAcknowledge` on a queue: behaves like `AutoAcknowledgeEach`.
    /// `DupsOkAcknowledge` on a topic: coalesces consumed acks and flushes
    /// on the half-prefetch heuristic. The distinction is carried by the
    /// caller picking the right variant at construction time.
    AutoAcknowledgeBatch,
    ClientAcknowledge,
    IndividualAcknowledge,
    Transacted,
}

/// The capability carried by a delivered message instead of a back-pointer
/// to its consumer. A tagged variant per ack mode, not a boxed closure.
#[derive(Clone)]
pub enum Acknowledger {
    /// Acking has no observable effect (auto-ack modes already acked the
    /// message before the application ever saw it).
    None,
    /// `IndividualAcknowledge`: ack exactly this message.
    Individual(Weak<MessageConsumer>, MessageId),
    /// `ClientAcknowledge` / `Transacted`: ack everything dispatched so far.
    Bulk(Weak<MessageConsumer>),
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acknowledger::None => write!(f, "Acknowledger::None"),
            Acknowledger::Individual(_, id) => write!(f, "Acknowledger::Individual({id})"),
            Acknowledger::Bulk(_) => write!(f, "Acknowledger::Bulk"),
        }
    }
}

impl Acknowledger {
    pub fn acknowledge(&self) -> Result<()> {
        match self {
            Acknowledger::None => Ok(()),
            Acknowledger::Individual(consumer, message_id) => consumer
                .upgrade()
                .ok_or_else(|| Error::ObjectClosed("consumer has been dropped".into()))?
                .acknowledge_individual(message_id),
            Acknowledger::Bulk(consumer) => consumer
                .upgrade()
                .ok_or_else(|| Error::ObjectClosed("consumer has been dropped".into()))?
                .acknowledge(),
        }
    }
}

/// A message handed to application code, carrying the capability to
/// acknowledge it (a no-op for modes that already acked automatically).
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message: Message,
    acknowledger: Acknowledger,
}

impl DeliveredMessage {
    pub fn acknowledge(&self) -> Result<()> { self.acknowledger.acknowledge() }
}

/// Application callback for asynchronous delivery. Requires `prefetch > 0`.
pub trait MessageListener: Send {
    fn on_message(&self, message: DeliveredMessage);
}

impl<F: Fn(DeliveredMessage) + Send> MessageListener for F {
    fn on_message(&self, message: DeliveredMessage) { self(message) }
}

pub(crate) struct DispatchedState {
    /// Head = most recently delivered, as specified; oldest sits at the
    /// back.
    pub dispatched: VecDeque<MessageDispatch>,
    pub pending_ack: Option<MessageAck>,
    pub delivered_counter: i64,
    pub additional_window_size: i64,
    pub redelivery_delay: Duration,
    pub redelivery_count: u32,
}

impl DispatchedState {
    fn new() -> Self {
        Self {
            dispatched: VecDeque::new(),
            pending_ack: None,
            delivered_counter: 0,
            additional_window_size: 0,
            redelivery_delay: Duration::ZERO,
            redelivery_count: 0,
        }
    }
}

/// The message consumer runtime described in this module's overview.
pub struct MessageConsumer {
    self_weak: Mutex<Weak<MessageConsumer>>,
    consumer_id: ConsumerId,
    destination: Destination,
    session: SessionHandle,
    ack_mode: AcknowledgementMode,
    redelivery_policy: RedeliveryPolicy,
    ignore_expiration: bool,
    prefetch_size: u32,

    channel: Box<dyn DispatchQueue>,
    dispatched: Mutex<DispatchedState>,
    listener: Mutex<Option<Box<dyn MessageListener>>>,

    delivering_acks: AtomicBool,
    synchronization_registered: AtomicBool,
    clear_dispatch_list: AtomicBool,
    in_progress_clear_required: AtomicBool,
    disposed: AtomicBool,
    last_delivered_sequence_id: AtomicI64,
    jitter_counter: AtomicU32,

    failure: Mutex<Option<String>>,
    exception_listener: Mutex<Option<Box<dyn Fn(&Error) + Send>>>,
    pending_redelivery: Mutex<Option<crate::timer::TimerHandle>>,
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("consumer_id", &self.consumer_id)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

impl MessageConsumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: ConsumerInfo,
        session: SessionHandle,
        ack_mode: AcknowledgementMode,
        redelivery_policy: RedeliveryPolicy,
        priority_supported: bool,
        ignore_expiration: bool,
    ) -> Arc<Self> {
        let channel: Box<dyn DispatchQueue> = if priority_supported {
            Box::new(PriorityDispatchChannel::new())
        } else {
            Box::new(DispatchChannel::new())
        };
        Arc::new_cyclic(|weak| Self {
            self_weak: Mutex::new(weak.clone()),
            consumer_id: info.consumer_id,
            destination: info.destination,
            session,
            ack_mode,
            redelivery_policy,
            ignore_expiration,
            prefetch_size: info.prefetch_size,
            channel,
            dispatched: Mutex::new(DispatchedState::new()),
            listener: Mutex::new(None),
            delivering_acks: AtomicBool::new(false),
            synchronization_registered: AtomicBool::new(false),
            clear_dispatch_list: AtomicBool::new(false),
            in_progress_clear_required: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_delivered_sequence_id: AtomicI64::new(0),
            jitter_counter: AtomicU32::new(0),
            failure: Mutex::new(None),
            exception_listener: Mutex::new(None),
            pending_redelivery: Mutex::new(None),
        })
    }

    pub fn consumer_id(&self) -> &ConsumerId { &self.consumer_id }

    pub fn destination(&self) -> &Destination { &self.destination }

    pub fn ack_mode(&self) -> AcknowledgementMode { self.ack_mode }

    pub fn last_delivered_sequence_id(&self) -> i64 {
        self.last_delivered_sequence_id.load(Ordering::Relaxed)
    }

    pub fn set_exception_listener(&self, listener: impl Fn(&Error) + Send + 'static) {
        *self.exception_listener.lock().unwrap() = Some(Box::new(listener));
    }

    fn is_pull_mode(&self) -> bool { self.prefetch_size == 0 }

    fn self_arc(&self) -> Option<Arc<MessageConsumer>> { self.self_weak.lock().unwrap().upgrade() }

    fn acknowledger_for_delivery(&self, message_id: &MessageId) -> Acknowledger {
        match self.ack_mode {
            AcknowledgementMode::IndividualAcknowledge => {
                Acknowledger::Individual(self.self_weak.lock().unwrap().clone(), message_id.clone())
            }
            AcknowledgementMode::ClientAcknowledge | AcknowledgementMode::Transacted => {
                Acknowledger::Bulk(self.self_weak.lock().unwrap().clone())
            }
            AcknowledgementMode::AutoAcknowledgeEach | AcknowledgementMode::AutoAcknowledgeBatch => {
                Acknowledger::None
            }
        }
    }

    /// `pull_timeout` is passed straight through as `MessagePull::timeout`:
    /// `Some(0)` asks the broker to wait indefinitely, `Some(n)` bounds the
    /// wait, `None` asks it to answer immediately even if empty.
    fn send_pull(&self, pull_timeout: Option<Duration>) -> Result<()> {
        self.session.send_oneway(Command::MessagePull(MessagePull {
            consumer_id: self.consumer_id.clone(),
            destination: self.destination.clone(),
            timeout: pull_timeout,
        }))
    }

    /// Blocks until a dispatch is available or the channel closes.
    #[instrument(skip(self))]
    pub fn receive(self: &Arc<Self>) -> Result<Option<DeliveredMessage>> {
        self.ensure_open()?;
        if self.is_pull_mode() {
            self.send_pull(Some(Duration::ZERO))?;
        }
        self.receive_with_deadline(None)
    }

    /// Blocks up to `timeout`. Prefetch zero switches to pull-mode.
    #[instrument(skip(self))]
    pub fn receive_timeout(self: &Arc<Self>, timeout: Duration) -> Result<Option<DeliveredMessage>> {
        self.ensure_open()?;
        if self.is_pull_mode() {
            self.send_pull(Some(timeout))?;
        }
        self.receive_with_deadline(Some(Instant::now() + timeout))
    }

    /// Polls once; prefetch zero sends a pull that asks the broker to
    /// answer immediately even if nothing is available.
    #[instrument(skip(self))]
    pub fn receive_no_wait(self: &Arc<Self>) -> Result<Option<DeliveredMessage>> {
        self.ensure_open()?;
        if self.is_pull_mode() {
            self.send_pull(None)?;
        }
        self.receive_with_deadline(Some(Instant::now()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::consumer_closed(&self.consumer_id))
        } else {
            Ok(())
        }
    }

    fn receive_with_deadline(
        self: &Arc<Self>,
        deadline: Option<Instant>,
    ) -> Result<Option<DeliveredMessage>> {
        loop {
            if let Some(failure) = self.failure.lock().unwrap().clone() {
                return Err(Error::ConnectionFailure(failure));
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let dispatch = match self.channel.dequeue(remaining) {
                Some(dispatch) => dispatch,
                None => return Ok(None),
            };
            let Some(message) = dispatch.message else { return Ok(None) };

            if !self.ignore_expiration && message.is_expired(Utc::now()) {
                self.record_delivery(message.message_id.clone());
                self.before_message_is_consumed(&message)?;
                self.after_message_is_consumed(true)?;
                continue;
            }

            self.record_delivery(message.message_id.clone());
            self.before_message_is_consumed(&message)?;
            let acknowledger = self.acknowledger_for_delivery(&message.message_id);
            self.after_message_is_consumed(false)?;
            return Ok(Some(DeliveredMessage { message, acknowledger }));
        }
    }

    fn record_delivery(&self, message_id: MessageId) {
        self.last_delivered_sequence_id
            .store(message_id.producer_sequence, Ordering::Relaxed);
    }

    /// Attach a listener. Requires `prefetch > 0`. Existing channel
    /// contents are redispatched at the executor's head so ordering is
    /// preserved across the brief stop/restart.
    #[instrument(skip(self, listener))]
    pub fn set_message_listener(
        self: &Arc<Self>,
        listener: impl MessageListener + 'static,
    ) -> Result<()> {
        if self.is_pull_mode() {
            return Err(Error::InvalidOperation(
                "cannot attach a listener to a zero-prefetch consumer".into(),
            ));
        }
        *self.listener.lock().unwrap() = Some(Box::new(listener));
        let pending = self.channel.remove_all();
        for dispatch in pending.into_iter().rev() {
            self.session.redispatch(dispatch);
        }
        Ok(())
    }

    pub fn remove_message_listener(&self) { *self.listener.lock().unwrap() = None; }

    /// The inbound dispatch algorithm run by the session executor.
    #[instrument(skip(self, dispatch))]
    pub fn dispatch(self: &Arc<Self>, dispatch: MessageDispatch) {
        if self.clear_dispatch_list.swap(false, Ordering::SeqCst) {
            self.channel.clear();
            let mut state = self.dispatched.lock().unwrap();
            if matches!(
                state.pending_ack.as_ref().map(|ack| ack.ack_type),
                Some(crate::command::AckType::Delivered)
            ) {
                state.pending_ack = None;
            }
        }
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let has_listener = self.listener.lock().unwrap().is_some();
        if has_listener {
            if let Some(message) = dispatch.message {
                self.record_delivery(message.message_id.clone());
                if let Err(err) = self.before_message_is_consumed(&message) {
                    warn!(%err, "failed to register pre-delivery acknowledgement bookkeeping");
                }
                let expired = !self.ignore_expiration && message.is_expired(Utc::now());
                let acknowledger = self.acknowledger_for_delivery(&message.message_id);
                if !expired {
                    self.invoke_listener(DeliveredMessage { message, acknowledger });
                }
                if let Err(err) = self.after_message_is_consumed(expired) {
                    warn!(%err, "failed to flush acknowledgement after delivery");
                }
            }
        } else {
            self.channel.enqueue(dispatch);
        }
    }

    fn invoke_listener(self: &Arc<Self>, message: DeliveredMessage) {
        let listener_guard = self.listener.lock().unwrap();
        let Some(listener) = listener_guard.as_ref() else { return };
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener.on_message(message);
        }));
        drop(listener_guard);
        if let Err(payload) = caught {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "listener panicked".to_string());
            let error = Error::InvalidOperation(reason);
            if let Some(handler) = self.exception_listener.lock().unwrap().as_ref() {
                handler(&error);
            }
            self.on_listener_exception();
        }
    }

    /// Auto-ack-family and individual-ack modes leave a message that threw
    /// out of its listener unacked — it's a redelivery candidate on the next
    /// rollback or reconnect. Client-ack and transacted modes treat it as
    /// consumed anyway, since in those modes the application (or the
    /// transaction) owns advancing delivery, not the listener's success.
    fn on_listener_exception(&self) {
        if matches!(
            self.ack_mode,
            AcknowledgementMode::ClientAcknowledge | AcknowledgementMode::Transacted
        ) {
            if let Err(err) = self.after_message_is_consumed(false) {
                warn!(%err, "failed to advance delivery after a listener exception");
            }
        }
    }

    #[instrument(skip(self, message))]
    fn before_message_is_consumed(&self, message: &Message) -> Result<()> {
        ack::before_message_is_consumed(self, message)
    }

    #[instrument(skip(self))]
    fn after_message_is_consumed(&self, expired: bool) -> Result<()> {
        ack::after_message_is_consumed(self, expired)
    }

    pub fn acknowledge(&self) -> Result<()> { ack::acknowledge(self) }

    pub fn acknowledge_individual(&self, message_id: &MessageId) -> Result<()> {
        ack::acknowledge_individual(self, message_id)
    }

    /// Transport-interrupt handling: drain the channel, invalidate a
    /// pending `DeliveredAck`, leave `dispatchedMessages` untouched.
    #[instrument(skip(self))]
    pub fn clear_messages_in_progress(&self) {
        self.channel.clear();
        let mut state = self.dispatched.lock().unwrap();
        if matches!(
            state.pending_ack.as_ref().map(|ack| ack.ack_type),
            Some(crate::command::AckType::Delivered)
        ) {
            state.pending_ack = None;
        }
        self.in_progress_clear_required.store(false, Ordering::SeqCst);
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(reason.into());
        self.channel.close();
    }

    /// `Shutdown`: flush auto-acks, for non-transacted consumers clear the
    /// dispatched list, close the channel. Does not talk to the broker —
    /// that's `Session::close`'s job via `RemoveInfo`.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if matches!(
            self.ack_mode,
            AcknowledgementMode::AutoAcknowledgeEach | AcknowledgementMode::AutoAcknowledgeBatch
        ) {
            let _ = ack::flush_pending(self);
        }
        if !matches!(self.ack_mode, AcknowledgementMode::Transacted) {
            self.dispatched.lock().unwrap().dispatched.clear();
        }
        if let Some(handle) = self.pending_redelivery.lock().unwrap().take() {
            handle.cancel();
        }
        self.channel.close();
    }

    /// `Close()` (§4.5): inside an active transaction, defers to an
    /// `AfterCommit`/`AfterRollback` synchronization that runs `DoClose`
    /// once the transaction resolves one way or the other; otherwise runs
    /// `DoClose` immediately. `DoClose` = `shutdown` plus removing this
    /// consumer from its session and sending `RemoveInfo` to the broker.
    #[instrument(skip(self))]
    pub fn close(self: &Arc<Self>) -> Result<()> {
        if self.session.in_transaction() {
            let after_commit_target = self.clone();
            let after_rollback_target = self.clone();
            let sync = Synchronization {
                before_end: None,
                after_commit: Some(Box::new(move || do_close(&after_commit_target))),
                after_rollback: Some(Box::new(move || do_close(&after_rollback_target))),
            };
            self.session
                .register_synchronization(SynchronizationOwner::ConsumerClose(self.consumer_id.clone()), sync);
            Ok(())
        } else {
            do_close(self);
            Ok(())
        }
    }
}

/// `Shutdown` plus the broker-facing half of `Close()`/`DoClose`: unregister
/// from the session and tell the broker this consumer is gone, carrying the
/// highest sequence id actually delivered.
fn do_close(consumer: &Arc<MessageConsumer>) {
    consumer.shutdown();
    if let Err(err) =
        consumer.session.close_consumer(&consumer.consumer_id, consumer.last_delivered_sequence_id())
    {
        warn!(%err, "failed to remove consumer from its session during close");
    }
}

#[cfg(test)]
impl MessageConsumer {
    pub(crate) fn dispatched_count(&self) -> usize { self.dispatched.lock().unwrap().dispatched.len() }

    pub(crate) fn pending_ack_type(&self) -> Option<crate::command::AckType> {
        self.dispatched.lock().unwrap().pending_ack.as_ref().map(|ack| ack.ack_type)
    }

    pub(crate) fn redelivery_count(&self) -> u32 { self.dispatched.lock().unwrap().redelivery_count }
}

impl DispatchTarget for MessageConsumer {
    fn dispatch(&self, dispatch: MessageDispatch) {
        match self.self_arc() {
            Some(arc) => MessageConsumer::dispatch(&arc, dispatch),
            None => warn!("dropping dispatch: consumer handle already gone"),
        }
    }
}

impl Dispatcher for MessageConsumer {
    fn dispatch(&self, dispatch: MessageDispatch) { DispatchTarget::dispatch(self, dispatch) }

    fn on_transport_interrupted(&self) {
        self.in_progress_clear_required.store(true, Ordering::SeqCst);
        self.clear_dispatch_list.store(true, Ordering::SeqCst);
    }

    fn on_transport_resumed(&self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        command::AckType,
        ids::{ConnectionId, ProducerId, SessionId},
        transport::support::RecordingTransport,
    };

    struct Fixture {
        consumer: Arc<MessageConsumer>,
        transport: Arc<RecordingTransport>,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    }

    fn make_message(producer_id: &ProducerId, seq: i64) -> Message {
        Message {
            message_id: MessageId::new(producer_id.clone(), seq),
            destination: Destination::queue("q.in"),
            transaction_id: None,
            persistent: true,
            priority: Message::DEFAULT_PRIORITY,
            expiration: None,
            redelivery_counter: 0,
            redelivered: false,
            body: vec![seq as u8],
        }
    }

    fn make_dispatch(consumer_id: &ConsumerId, producer_id: &ProducerId, seq: i64) -> MessageDispatch {
        MessageDispatch {
            consumer_id: consumer_id.clone(),
            destination: Destination::queue("q.in"),
            message: Some(make_message(producer_id, seq)),
            redelivery_counter: 0,
        }
    }

    fn fixture(ack_mode: AcknowledgementMode, prefetch: u32, policy: RedeliveryPolicy) -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let session_id = SessionId::new(ConnectionId::from("conn-1"), 1);
        let consumer_id = ConsumerId::new(session_id.clone(), 1);
        let producer_id = ProducerId::new(session_id.clone(), 1);
        let handle = SessionHandle::for_test(session_id, transport.clone());
        let info = ConsumerInfo {
            consumer_id: consumer_id.clone(),
            destination: Destination::queue("q.in"),
            subscription_name: None,
            selector: None,
            prefetch_size: prefetch,
            maximum_pending: None,
            no_local: false,
            browser: false,
            dispatch_async: true,
            priority: 0,
        };
        let consumer = MessageConsumer::new(info, handle, ack_mode, policy, false, false);
        Fixture { consumer, transport, consumer_id, producer_id }
    }

    fn sent_acks(transport: &RecordingTransport) -> Vec<MessageAck> {
        transport
            .sent()
            .into_iter()
            .filter_map(|command| match command {
                Command::MessageAck(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn auto_ack_flushes_a_consumed_ack_after_every_delivery() {
        let fx = fixture(AcknowledgementMode::AutoAcknowledgeEach, 100, RedeliveryPolicy::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        fx.consumer
            .set_message_listener(move |m: DeliveredMessage| {
                received_clone.lock().unwrap().push(m.message.message_id.producer_sequence);
            })
            .unwrap();

        for seq in 1..=10 {
            fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, seq));
        }

        assert_eq!(*received.lock().unwrap(), (1..=10).collect::<Vec<_>>());
        let acks = sent_acks(&fx.transport);
        assert_eq!(acks.len(), 10);
        assert!(acks.iter().all(|ack| ack.ack_type == AckType::Consumed && ack.message_count == 1));
        assert_eq!(fx.consumer.dispatched_count(), 0);
    }

    #[test]
    fn client_ack_coalesces_into_a_single_range_ack() {
        // prefetch high enough that the half-prefetch credit-refill flush
        // never kicks in mid-batch, so every delivery coalesces into one
        // pending `Delivered` ack until the explicit `acknowledge()`.
        let fx = fixture(AcknowledgementMode::ClientAcknowledge, 20, RedeliveryPolicy::default());
        for seq in 1..=6 {
            fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, seq));
        }
        for _ in 1..=6 {
            fx.consumer.receive_no_wait().unwrap().unwrap();
        }
        assert_eq!(fx.consumer.dispatched_count(), 6);
        assert_eq!(fx.consumer.pending_ack_type(), Some(AckType::Delivered));

        fx.consumer.acknowledge().unwrap();

        let acks = sent_acks(&fx.transport);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack_type, AckType::Consumed);
        assert_eq!(acks[0].first_message_id.producer_sequence, 1);
        assert_eq!(acks[0].last_message_id.producer_sequence, 6);
        assert_eq!(acks[0].message_count, 6);
        assert_eq!(fx.consumer.dispatched_count(), 0);
    }

    #[test]
    fn rollback_redelivers_in_original_order_and_bumps_the_redelivery_counter() {
        let policy = RedeliveryPolicy { initial_redelivery_delay: Duration::ZERO, ..RedeliveryPolicy::default() };
        let fx = fixture(AcknowledgementMode::Transacted, 4, policy);

        fx.consumer.session.begin_transaction().unwrap();
        for seq in 1..=4 {
            fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, seq));
        }
        for _ in 1..=4 {
            fx.consumer.receive_no_wait().unwrap().unwrap();
        }
        assert_eq!(fx.consumer.dispatched_count(), 4);

        fx.consumer.session.rollback_transaction().unwrap();
        assert_eq!(fx.consumer.dispatched_count(), 0);
        assert_eq!(fx.consumer.redelivery_count(), 1);

        // flush_transacted_consumed ran as the before_end hook, tagging a
        // Consumed ack with the (now-rolled-back) transaction id; the broker
        // discards it since the transaction never committed.
        let acks = sent_acks(&fx.transport);
        let consumed = acks.iter().find(|a| a.ack_type == AckType::Consumed).unwrap();
        assert!(consumed.transaction_id.is_some());
        // This batch has never been redelivered before, so there's no
        // redelivery history to report yet: a first rollback sends no
        // RedeliveredAck.
        assert!(!acks.iter().any(|a| a.ack_type == AckType::Redelivered));

        let first = fx.consumer.receive_timeout(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(first.message.message_id.producer_sequence, 1);
        assert_eq!(first.message.redelivery_counter, 1);
        assert!(first.message.redelivered);
    }

    #[test]
    fn exhausted_redelivery_sends_a_poison_ack_and_does_not_requeue() {
        let policy = RedeliveryPolicy {
            initial_redelivery_delay: Duration::ZERO,
            maximum_redeliveries: 2,
            ..RedeliveryPolicy::default()
        };
        let fx = fixture(AcknowledgementMode::Transacted, 1, policy);

        fx.consumer.session.begin_transaction().unwrap();
        fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, 1));
        fx.consumer.receive_no_wait().unwrap().unwrap();

        for round in 1..=3u32 {
            fx.consumer.session.rollback_transaction().unwrap();
            if round < 3 {
                fx.consumer.session.begin_transaction().unwrap();
                let redelivered =
                    fx.consumer.receive_timeout(Duration::from_millis(200)).unwrap().unwrap();
                assert_eq!(redelivered.message.redelivery_counter, round);
                assert!(redelivered.message.redelivered);
            }
        }

        let acks = sent_acks(&fx.transport);
        assert_eq!(acks.iter().filter(|a| a.ack_type == AckType::Poison).count(), 1);
        // round 1 is the first rollback (no redelivery history yet, no ack);
        // round 2 is the first repeat, so it alone sends a RedeliveredAck;
        // round 3 exceeds maximum_redeliveries and poisons instead.
        assert_eq!(acks.iter().filter(|a| a.ack_type == AckType::Redelivered).count(), 1);
        assert_eq!(fx.consumer.dispatched_count(), 0);
        assert_eq!(fx.consumer.redelivery_count(), 0);
    }

    #[test]
    fn transport_interrupt_clears_the_channel_but_preserves_dispatched_messages() {
        let fx = fixture(AcknowledgementMode::ClientAcknowledge, 10, RedeliveryPolicy::default());
        fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, 1));
        fx.consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(fx.consumer.dispatched_count(), 1);
        assert_eq!(fx.consumer.pending_ack_type(), Some(AckType::Delivered));

        fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, 2));
        fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, 3));

        fx.consumer.on_transport_interrupted();
        fx.consumer.clear_messages_in_progress();

        assert_eq!(fx.consumer.dispatched_count(), 1, "already-delivered messages are untouched");
        assert_eq!(fx.consumer.pending_ack_type(), None, "a pending DeliveredAck is invalidated");
        assert!(
            fx.consumer.receive_no_wait().unwrap().is_none(),
            "queued-but-undelivered messages are dropped"
        );
    }

    #[test]
    fn pull_mode_sends_a_message_pull_before_waiting() {
        let fx = fixture(AcknowledgementMode::AutoAcknowledgeEach, 0, RedeliveryPolicy::default());
        fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, 1));
        let message = fx.consumer.receive_timeout(Duration::from_millis(200)).unwrap();
        assert!(message.is_some());
        assert!(fx.transport.sent().iter().any(|c| matches!(c, Command::MessagePull(_))));
    }

    #[test]
    fn listener_attachment_requires_a_positive_prefetch() {
        let fx = fixture(AcknowledgementMode::AutoAcknowledgeEach, 0, RedeliveryPolicy::default());
        let result = fx.consumer.set_message_listener(|_: DeliveredMessage| {});
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn individual_ack_removes_exactly_one_message() {
        let fx = fixture(AcknowledgementMode::IndividualAcknowledge, 10, RedeliveryPolicy::default());
        for seq in 1..=3 {
            fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, seq));
        }
        let delivered: Vec<_> =
            (1..=3).map(|_| fx.consumer.receive_no_wait().unwrap().unwrap()).collect();
        delivered[1].acknowledge().unwrap();

        assert_eq!(fx.consumer.dispatched_count(), 2);
        let acks = sent_acks(&fx.transport);
        let individual = acks.iter().find(|a| a.ack_type == AckType::Individual).unwrap();
        assert_eq!(individual.first_message_id.producer_sequence, 2);
        assert_eq!(individual.message_count, 1);
    }

    #[test]
    fn expired_messages_are_dropped_without_reaching_the_application() {
        let fx = fixture(AcknowledgementMode::AutoAcknowledgeEach, 10, RedeliveryPolicy::default());
        let mut dispatch = make_dispatch(&fx.consumer_id, &fx.producer_id, 1);
        dispatch.message.as_mut().unwrap().expiration = Some(Utc::now() - chrono::Duration::seconds(1));
        fx.consumer.dispatch(dispatch);

        assert!(fx.consumer.receive_no_wait().unwrap().is_none());
        // an expired message still runs through the full ack bookkeeping so
        // it doesn't come back on the next poll.
        assert_eq!(fx.consumer.dispatched_count(), 0);
    }

    #[test]
    fn receive_after_shutdown_is_an_object_closed_error() {
        let fx = fixture(AcknowledgementMode::ClientAcknowledge, 10, RedeliveryPolicy::default());
        fx.consumer.shutdown();
        assert!(matches!(fx.consumer.receive_no_wait(), Err(Error::ObjectClosed(_))));
    }

    #[test]
    fn shutdown_is_idempotent_and_closes_the_channel() {
        let fx = fixture(AcknowledgementMode::ClientAcknowledge, 10, RedeliveryPolicy::default());
        fx.consumer.dispatch(make_dispatch(&fx.consumer_id, &fx.producer_id, 1));
        fx.consumer.receive_no_wait().unwrap().unwrap();

        fx.consumer.shutdown();
        fx.consumer.shutdown();

        assert!(fx.consumer.receive_no_wait().unwrap().is_none());
    }
}
