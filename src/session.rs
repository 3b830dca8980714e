//! Sessions: the factory for consumers and producers, and the owner of the
//! executor and transaction context they share.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::instrument;

use crate::{
    command::{
        Command, ConsumerInfo, Destination, ObjectId, ProducerInfo, RemoveInfo,
        RemoveSubscriptionInfo, SessionInfo,
    },
    consumer::{AcknowledgementMode, MessageConsumer},
    executor::SessionExecutor,
    ids::{ConsumerId, ProducerId, SessionId},
    producer::MessageProducer,
    redelivery::RedeliveryPolicy,
    state::ConnectionStateTracker,
    timer::TimerService,
    transaction::{Synchronization, SynchronizationOwner, TransactionContext},
    transport::Transport,
    Error, Result,
};

/// The non-owning capability a consumer or producer is given instead of a
/// back-pointer to its owning `Session`. Exposes exactly what a child needs:
/// send a command, register a transaction synchronization, push a dispatch
/// back to the head of the executor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id:  SessionId,
    transport:   Arc<dyn Transport>,
    transaction: Arc<TransactionContext>,
    executor:    Arc<SessionExecutor>,
    timer:       Arc<TimerService>,
    session:     std::sync::Weak<Session>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("session_id", &self.session_id).finish()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId { &self.session_id }

    pub fn send_oneway(&self, command: Command) -> Result<()> { self.transport.oneway(command) }

    pub fn send_sync(&self, command: Command, timeout: Option<Duration>) -> Result<Command> {
        self.transport.sync_request(command, timeout)
    }

    pub fn register_synchronization(&self, owner: SynchronizationOwner, sync: Synchronization) {
        self.transaction.add_synchronization(owner, sync)
    }

    pub fn redispatch(&self, dispatch: crate::command::MessageDispatch) {
        self.executor.execute_first(dispatch)
    }

    pub fn transaction_id(&self) -> Option<crate::ids::TransactionId> {
        self.transaction.transaction_id()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.in_local_transaction() || self.transaction.in_net_transaction()
    }

    pub fn begin_transaction(&self) -> Result<crate::ids::TransactionId> {
        self.transaction.begin(&self.session_id.connection_id)
    }

    pub fn timer(&self) -> &Arc<TimerService> { &self.timer }

    /// `Close()` on an individual consumer (§4.5, "Close vs Shutdown"):
    /// remove it from the transport's dispatcher table, the executor, and
    /// the owning session's consumer map, then send `RemoveInfo` carrying
    /// its own last-delivered sequence id. A no-op if the owning `Session`
    /// has already been dropped or closed.
    pub fn close_consumer(&self, consumer_id: &ConsumerId, last_delivered_sequence_id: i64) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.do_close_consumer(consumer_id, last_delivered_sequence_id),
            None => Ok(()),
        }
    }

    /// `Close()` on an individual producer: remove it from the owning
    /// session's producer map and send `RemoveInfo`.
    pub fn close_producer(&self, producer_id: &ProducerId) {
        if let Some(session) = self.session.upgrade() {
            session.do_close_producer(producer_id);
        }
    }

    /// Build a standalone handle for unit tests elsewhere in the crate
    /// (producer/consumer tests) that need one without spinning up a full
    /// `Session`. `close_consumer`/`close_producer` are no-ops against a
    /// handle built this way since there is no owning `Session` to upgrade
    /// the weak reference to.
    #[cfg(test)]
    pub(crate) fn for_test(session_id: SessionId, transport: Arc<dyn Transport>) -> Self {
        let executor = Arc::new(SessionExecutor::new());
        executor.start();
        Self {
            session_id,
            transaction: Arc::new(TransactionContext::new(transport.clone())),
            transport,
            executor,
            timer: TimerService::start(),
            session: std::sync::Weak::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn commit_transaction(&self) -> Result<()> { self.transaction.commit() }

    #[cfg(test)]
    pub(crate) fn rollback_transaction(&self) -> Result<()> { self.transaction.rollback() }
}

/// A JMS-style session: a factory for consumers and producers that routes
/// inbound dispatches to them and owns the local transaction boundary they
/// share.
pub struct Session {
    info:        SessionInfo,
    handle:      SessionHandle,
    executor:    Arc<SessionExecutor>,
    consumers:   Mutex<HashMap<ConsumerId, Arc<MessageConsumer>>>,
    producers:   Mutex<HashMap<ProducerId, Arc<MessageProducer>>>,
    transport:   Arc<dyn Transport>,
    state:       Arc<ConnectionStateTracker>,
    transacted:  bool,
    priority_supported: bool,
    next_consumer_value: std::sync::atomic::AtomicI64,
    next_producer_value: std::sync::atomic::AtomicI64,
    closing:     std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("session_id", &self.info.session_id).finish_non_exhaustive()
    }
}

impl Session {
    #[instrument(skip(transport, state, timer))]
    pub fn new(
        session_id: SessionId,
        transport: Arc<dyn Transport>,
        state: Arc<ConnectionStateTracker>,
        timer: Arc<TimerService>,
        transacted: bool,
        priority_supported: bool,
    ) -> Result<Arc<Self>> {
        state.add_session(session_id.clone())?;
        let executor = Arc::new(SessionExecutor::new());
        executor.start();
        let transaction = Arc::new(TransactionContext::new(transport.clone()));
        let session = Arc::new_cyclic(|weak| {
            let handle = SessionHandle {
                session_id: session_id.clone(),
                transport: transport.clone(),
                transaction,
                executor: executor.clone(),
                timer,
                session: weak.clone(),
            };
            Self {
                info: SessionInfo { session_id },
                handle,
                executor,
                consumers: Mutex::new(HashMap::new()),
                producers: Mutex::new(HashMap::new()),
                transport,
                state,
                transacted,
                priority_supported,
                next_consumer_value: std::sync::atomic::AtomicI64::new(1),
                next_producer_value: std::sync::atomic::AtomicI64::new(1),
                closing: std::sync::atomic::AtomicBool::new(false),
            }
        });
        Ok(session)
    }

    pub fn session_id(&self) -> &SessionId { &self.info.session_id }

    pub fn is_transacted(&self) -> bool { self.transacted }

    fn next_consumer_id(&self) -> ConsumerId {
        let value =
            self.next_consumer_value.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ConsumerId::new(self.info.session_id.clone(), value)
    }

    fn next_producer_id(&self) -> ProducerId {
        let value =
            self.next_producer_value.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ProducerId::new(self.info.session_id.clone(), value)
    }

    /// Create a consumer against `destination`. Registers the dispatcher
    /// with the transport, then the executor, then issues `ConsumerInfo` as
    /// a synchronous request so a broker rejection rolls back every step
    /// already taken.
    #[instrument(skip(self))]
    #[allow(clippy::too_many_arguments)]
    pub fn create_consumer(
        self: &Arc<Self>,
        destination: Destination,
        subscription_name: Option<String>,
        selector: Option<String>,
        prefetch_size: u32,
        no_local: bool,
        browser: bool,
        ack_mode: AcknowledgementMode,
    ) -> Result<Arc<MessageConsumer>> {
        if destination.physical_name.is_empty() {
            return Err(Error::InvalidDestination);
        }
        let info = ConsumerInfo {
            consumer_id: self.next_consumer_id(),
            destination,
            subscription_name,
            selector,
            prefetch_size,
            maximum_pending: None,
            no_local,
            browser,
            dispatch_async: true,
            priority: 0,
        };
        self.create_consumer_with(info, ack_mode, RedeliveryPolicy::default(), false)
    }

    /// Create a consumer from a destination URI, applying `consumer.*` query
    /// parameters to the `ConsumerInfo` it builds and `consumer.nms.*`
    /// parameters to the consumer object itself (§6, §10.3). `session.*`
    /// parameters are parsed but not applied here — they configure the
    /// session at construction time, not per-consumer.
    #[instrument(skip(self))]
    pub fn create_consumer_from_uri(
        self: &Arc<Self>,
        uri: &str,
        ack_mode: AcknowledgementMode,
        redelivery_policy: RedeliveryPolicy,
    ) -> Result<Arc<MessageConsumer>> {
        let parsed = crate::uri::parse_destination_uri(uri)?;
        let opts = parsed.consumer;
        let info = ConsumerInfo {
            consumer_id: self.next_consumer_id(),
            destination: parsed.destination,
            subscription_name: opts.subscription_name,
            selector: opts.selector,
            prefetch_size: opts.prefetch_size.unwrap_or(1000),
            maximum_pending: opts.maximum_pending_message_limit,
            no_local: opts.no_local.unwrap_or(false),
            browser: opts.browser.unwrap_or(false),
            dispatch_async: opts.dispatch_async.unwrap_or(true),
            priority: opts.priority.unwrap_or(0),
        };
        let ignore_expiration = parsed.consumer_local.ignore_expiration.unwrap_or(false);
        self.create_consumer_with(info, ack_mode, redelivery_policy, ignore_expiration)
    }

    fn create_consumer_with(
        self: &Arc<Self>,
        info: ConsumerInfo,
        ack_mode: AcknowledgementMode,
        redelivery_policy: RedeliveryPolicy,
        ignore_expiration: bool,
    ) -> Result<Arc<MessageConsumer>> {
        if info.destination.physical_name.is_empty() {
            return Err(Error::InvalidDestination);
        }
        let consumer_id = info.consumer_id.clone();

        let consumer = MessageConsumer::new(
            info.clone(),
            self.handle.clone(),
            ack_mode,
            redelivery_policy,
            self.priority_supported,
            ignore_expiration,
        );

        self.executor.register(consumer_id.clone(), consumer.clone());
        self.transport.add_dispatcher(consumer_id.clone(), consumer.clone());

        let result = self.transport.sync_request(Command::ConsumerInfo(info.clone()), None);
        if let Err(err) = result {
            self.transport.remove_dispatcher(&consumer_id);
            self.executor.unregister(&consumer_id);
            return Err(err);
        }

        self.state.with_session_mut(&self.info.session_id, |session_state| {
            session_state.add_consumer(info)
        });
        self.consumers.lock().unwrap().insert(consumer_id, consumer.clone());
        Ok(consumer)
    }

    /// Create a producer, optionally bound to a fixed `destination` (a
    /// producer with none sends to whatever destination each message
    /// carries). Registration is fire-and-forget: producer creation failure
    /// is not expected to be observable broker-side.
    #[instrument(skip(self))]
    pub fn create_producer(
        self: &Arc<Self>,
        destination: Option<Destination>,
        window_size: Option<u32>,
    ) -> Result<Arc<MessageProducer>> {
        let producer_id = self.next_producer_id();
        let info = ProducerInfo { producer_id: producer_id.clone(), destination, window_size };
        self.transport.oneway(Command::ProducerInfo(info.clone()))?;

        let producer =
            Arc::new(MessageProducer::new(info.clone(), self.handle.clone(), self.transacted));

        self.state.with_session_mut(&self.info.session_id, |session_state| {
            session_state.add_producer(info)
        });
        self.producers.lock().unwrap().insert(producer_id, producer.clone());
        Ok(producer)
    }

    /// Remove a durable topic subscription that is not currently active on
    /// this session (no consumer bound to it). A synchronous request, same
    /// as consumer creation, so a broker rejection (subscription still in
    /// use, or unknown) surfaces to the caller instead of failing silently.
    #[instrument(skip(self))]
    pub fn unsubscribe(&self, client_id: impl Into<String>, subscription_name: impl Into<String>) -> Result<()> {
        self.transport
            .sync_request(
                Command::RemoveSubscriptionInfo(RemoveSubscriptionInfo {
                    connection_id: self.info.session_id.connection_id.clone(),
                    client_id: client_id.into(),
                    subscription_name: subscription_name.into(),
                }),
                None,
            )
            .map(|_| ())
    }

    pub fn commit(&self) -> Result<()> {
        if !self.transacted {
            return Err(Error::InvalidOperation("commit called on a non-transacted session".into()));
        }
        self.handle.transaction.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        if !self.transacted {
            return Err(Error::InvalidOperation(
                "rollback called on a non-transacted session".into(),
            ));
        }
        self.handle.transaction.rollback()
    }

    /// `DoClose` for one consumer (§4.5): shut it down, then unregister it
    /// from the transport's dispatcher table, the executor, this session's
    /// consumer map and the connection state tracker, and finally tell the
    /// broker with `RemoveInfo`. Called either directly (non-transacted, or
    /// no active transaction) or from the `AfterCommit`/`AfterRollback`
    /// synchronization a transacted `Close()` defers to.
    pub(crate) fn do_close_consumer(
        self: &Arc<Self>,
        consumer_id: &ConsumerId,
        last_delivered_sequence_id: i64,
    ) -> Result<()> {
        if let Some(consumer) = self.consumers.lock().unwrap().remove(consumer_id) {
            consumer.shutdown();
        }
        self.transport.remove_dispatcher(consumer_id);
        self.executor.unregister(consumer_id);
        self.state.with_session_mut(&self.info.session_id, |session_state| {
            session_state.remove_consumer(consumer_id);
        });
        self.transport.oneway(Command::RemoveInfo(RemoveInfo {
            object_id: ObjectId::Consumer(consumer_id.clone()),
            last_delivered_sequence_id: last_delivered_sequence_id.max(0),
        }))
    }

    /// `DoClose` for one producer: shut it down, remove it from this
    /// session's producer map and the connection state tracker, and tell the
    /// broker with `RemoveInfo`. One-way, like producer creation — a
    /// producer teardown failing broker-side is not expected to be
    /// observable.
    pub(crate) fn do_close_producer(self: &Arc<Self>, producer_id: &ProducerId) {
        if let Some(producer) = self.producers.lock().unwrap().remove(producer_id) {
            producer.shutdown();
        }
        self.state.with_session_mut(&self.info.session_id, |session_state| {
            session_state.remove_producer(producer_id);
        });
        let _ = self.transport.oneway(Command::RemoveInfo(RemoveInfo {
            object_id: ObjectId::Producer(producer_id.clone()),
            last_delivered_sequence_id: 0,
        }));
    }

    /// Session close: stop the executor, shut down every child, roll back
    /// any open local transaction, remove this session from the connection,
    /// and send `RemoveInfo` carrying the minimum delivered sequence id
    /// across children (clamped at zero — a child that never delivered
    /// anything must not push this negative).
    #[instrument(skip(self))]
    pub fn close(self: &Arc<Self>) -> Result<()> {
        if self.closing.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        self.executor.stop(Some(Duration::from_secs(30)));

        let mut min_last_delivered = i64::MAX;
        for consumer in self.consumers.lock().unwrap().values() {
            consumer.shutdown();
            min_last_delivered = min_last_delivered.min(consumer.last_delivered_sequence_id());
            self.transport.remove_dispatcher(consumer.consumer_id());
        }
        for producer in self.producers.lock().unwrap().values() {
            producer.shutdown();
        }

        if self.handle.transaction.in_local_transaction() {
            let _ = self.handle.transaction.rollback();
        }

        self.state.remove_session(&self.info.session_id)?;

        let last_delivered_sequence_id = if min_last_delivered == i64::MAX {
            0
        } else {
            min_last_delivered.max(0)
        };
        self.transport.oneway(Command::RemoveInfo(RemoveInfo {
            object_id: ObjectId::Session(self.info.session_id.clone()),
            last_delivered_sequence_id,
        }))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{ids::ConnectionId, transport::support::RecordingTransport};

    fn session(transacted: bool) -> (Arc<Session>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let state = Arc::new(ConnectionStateTracker::new(crate::command::ConnectionInfo {
            connection_id: ConnectionId::from("conn-1"),
            client_id: None,
            user_name: None,
        }));
        let timer = TimerService::start();
        let session_id = SessionId::new(ConnectionId::from("conn-1"), 1);
        let session =
            Session::new(session_id, transport.clone(), state, timer, transacted, false).unwrap();
        (session, transport)
    }

    #[test]
    fn create_consumer_rejects_an_empty_destination_name() {
        let (session, _transport) = session(false);
        let result = session.create_consumer(
            Destination::queue(""),
            None,
            None,
            10,
            false,
            false,
            AcknowledgementMode::AutoAcknowledgeEach,
        );
        assert!(matches!(result, Err(Error::InvalidDestination)));
    }

    #[test]
    fn create_consumer_rolls_back_registration_on_broker_rejection() {
        let (session, transport) = session(false);
        transport.fail_next_sync("destination not found");
        let result = session.create_consumer(
            Destination::queue("orders"),
            None,
            None,
            10,
            false,
            false,
            AcknowledgementMode::AutoAcknowledgeEach,
        );
        assert!(result.is_err());
        assert_eq!(session.consumers.lock().unwrap().len(), 0);
    }

    #[test]
    fn create_consumer_from_uri_applies_query_parameters() {
        let (session, transport) = session(false);
        let consumer = session
            .create_consumer_from_uri(
                "queue://orders?consumer.prefetchSize=5&consumer.nms.IgnoreExpiration=true",
                AcknowledgementMode::AutoAcknowledgeEach,
                RedeliveryPolicy::default(),
            )
            .unwrap();
        assert_eq!(consumer.destination().physical_name, "orders");
        let sent_prefetch = transport
            .sent()
            .into_iter()
            .find_map(|c| match c {
                Command::ConsumerInfo(info) => Some(info.prefetch_size),
                _ => None,
            })
            .unwrap();
        assert_eq!(sent_prefetch, 5);
    }

    #[test]
    fn create_producer_registers_with_the_session() {
        let (session, transport) = session(false);
        let producer = session.create_producer(Some(Destination::queue("orders")), None).unwrap();
        assert_eq!(session.producers.lock().unwrap().len(), 1);
        assert!(transport.sent().iter().any(|c| matches!(c, Command::ProducerInfo(_))));
        drop(producer);
    }

    #[test]
    fn unsubscribe_sends_a_remove_subscription_info_request() {
        let (session, transport) = session(false);
        session.unsubscribe("demo-client", "orders-sub").unwrap();
        let sent = transport
            .sent()
            .into_iter()
            .find_map(|c| match c {
                Command::RemoveSubscriptionInfo(info) => Some(info),
                _ => None,
            })
            .unwrap();
        assert_eq!(sent.client_id, "demo-client");
        assert_eq!(sent.subscription_name, "orders-sub");
    }

    #[test]
    fn commit_on_a_non_transacted_session_is_an_error() {
        let (session, _transport) = session(false);
        assert!(matches!(session.commit(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn rollback_on_a_non_transacted_session_is_an_error() {
        let (session, _transport) = session(false);
        assert!(matches!(session.rollback(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn commit_on_a_transacted_session_does_not_deadlock_with_a_registered_consumer() {
        let (session, transport) = session(true);
        let consumer = session
            .create_consumer(
                Destination::queue("orders"),
                None,
                None,
                10,
                false,
                false,
                AcknowledgementMode::Transacted,
            )
            .unwrap();
        session.handle.begin_transaction().unwrap();

        let destination = consumer.destination().clone();
        let producer_id = ProducerId::new(session.session_id().clone(), 1);
        transport.deliver(crate::command::MessageDispatch {
            consumer_id: consumer.consumer_id().clone(),
            destination: destination.clone(),
            message: Some(crate::command::Message {
                message_id: crate::ids::MessageId::new(producer_id, 1),
                destination,
                transaction_id: None,
                persistent: true,
                priority: crate::command::Message::DEFAULT_PRIORITY,
                expiration: None,
                redelivery_counter: 0,
                redelivered: false,
                body: vec![1],
            }),
            redelivery_counter: 0,
        });
        consumer.receive_timeout(Duration::from_millis(200)).unwrap();

        // Delivery under `Transacted` mode registers a `before_end`
        // synchronization that calls back into this same `TransactionContext`
        // via `SessionHandle::transaction_id` while building its own ack —
        // this is the path that used to deadlock before `TransactionContext`
        // stopped holding its lock across synchronization callbacks.
        session.commit().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_sends_remove_info() {
        let (session, transport) = session(false);
        session.create_consumer(
            Destination::queue("orders"),
            None,
            None,
            10,
            false,
            false,
            AcknowledgementMode::AutoAcknowledgeEach,
        ).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        let remove_count =
            transport.sent().iter().filter(|c| matches!(c, Command::RemoveInfo(_))).count();
        assert_eq!(remove_count, 1);
    }

    #[test]
    fn close_clamps_last_delivered_sequence_id_at_zero() {
        let (session, transport) = session(false);
        session.create_consumer(
            Destination::queue("orders"),
            None,
            None,
            10,
            false,
            false,
            AcknowledgementMode::AutoAcknowledgeEach,
        ).unwrap();
        session.close().unwrap();
        let remove_info = transport
            .sent()
            .into_iter()
            .find_map(|c| match c {
                Command::RemoveInfo(info) => Some(info),
                _ => None,
            })
            .unwrap();
        assert_eq!(remove_info.last_delivered_sequence_id, 0);
    }

    #[test]
    fn consumer_close_outside_a_transaction_unregisters_immediately() {
        let (session, transport) = session(false);
        let consumer = session
            .create_consumer(
                Destination::queue("orders"),
                None,
                None,
                10,
                false,
                false,
                AcknowledgementMode::AutoAcknowledgeEach,
            )
            .unwrap();
        let consumer_id = consumer.consumer_id().clone();

        consumer.close().unwrap();

        assert_eq!(session.consumers.lock().unwrap().len(), 0);
        let remove_info = transport
            .sent()
            .into_iter()
            .find_map(|c| match c {
                Command::RemoveInfo(info) => Some(info),
                _ => None,
            })
            .unwrap();
        assert!(matches!(remove_info.object_id, ObjectId::Consumer(id) if id == consumer_id));
        assert!(matches!(consumer.receive_no_wait(), Err(Error::ObjectClosed(_))));
    }

    #[test]
    fn consumer_close_inside_a_transaction_defers_until_commit() {
        let (session, transport) = session(true);
        let consumer = session
            .create_consumer(
                Destination::queue("orders"),
                None,
                None,
                10,
                false,
                false,
                AcknowledgementMode::Transacted,
            )
            .unwrap();
        session.handle.begin_transaction().unwrap();

        consumer.close().unwrap();
        // deferred: the consumer is still registered and hasn't sent
        // RemoveInfo until the transaction resolves.
        assert_eq!(session.consumers.lock().unwrap().len(), 1);
        assert!(!transport.sent().iter().any(|c| matches!(c, Command::RemoveInfo(_))));

        session.commit().unwrap();

        assert_eq!(session.consumers.lock().unwrap().len(), 0);
        assert!(transport.sent().iter().any(|c| matches!(c, Command::RemoveInfo(_))));
    }

    #[test]
    fn producer_close_unregisters_and_sends_remove_info() {
        let (session, transport) = session(false);
        let producer = session.create_producer(Some(Destination::queue("orders")), None).unwrap();
        let producer_id = producer.producer_id().clone();

        producer.close();

        assert_eq!(session.producers.lock().unwrap().len(), 0);
        let remove_info = transport
            .sent()
            .into_iter()
            .find_map(|c| match c {
                Command::RemoveInfo(info) => Some(info),
                _ => None,
            })
            .unwrap();
        assert!(matches!(remove_info.object_id, ObjectId::Producer(id) if id == producer_id));
    }
}
