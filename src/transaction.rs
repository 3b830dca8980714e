//! Per-session local transaction coordination.
//!
//! One `TransactionContext` lives inside each `Session`. It owns the
//! current `TransactionId` (if any), the ordered set of synchronizations
//! registered against it, and the `Begin`/`Commit`/`Rollback` protocol
//! against the broker.

use std::sync::Mutex;

use tracing::{instrument, warn};

use crate::{
    command::{Command, TransactionInfo, TransactionType},
    ids::{ConsumerId, ProducerId, TransactionId},
    transport::Transport,
    Error, Result,
};

/// Identifies which child registered a synchronization, so re-registering
/// from the same owner is a no-op rather than a duplicate callback.
///
/// `Consumer`/`Producer` key the per-delivery ack-bookkeeping
/// synchronization a consumer registers the first time it delivers inside a
/// transaction; `ConsumerClose` is a distinct key so a `Close()` call made
/// while that ack sync is already registered still gets its own slot instead
/// of being silently dropped by the owner-dedup rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SynchronizationOwner {
    Consumer(ConsumerId),
    Producer(ProducerId),
    ConsumerClose(ConsumerId),
}

/// The three transaction-lifecycle callbacks a consumer/session can hook.
/// Modelled as a closure-holding struct (each phase defaults to a no-op)
/// rather than a trait object, so ordinary `FnMut` closures at the call
/// site are enough — no vtable, no base class.
#[derive(Default)]
pub struct Synchronization {
    pub before_end:     Option<Box<dyn FnMut() + Send>>,
    pub after_commit:   Option<Box<dyn FnMut() + Send>>,
    pub after_rollback: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for Synchronization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronization").finish_non_exhaustive()
    }
}

struct Inner {
    transaction_id:      Option<TransactionId>,
    in_local_transaction: bool,
    in_net_transaction:   bool,
    synchronizations:     Vec<(SynchronizationOwner, Synchronization)>,
    next_tx_ordinal:      u64,
}

/// Per-session transaction state plus the broker protocol to drive it.
pub struct TransactionContext {
    inner:     Mutex<Inner>,
    transport: std::sync::Arc<dyn Transport>,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext").finish_non_exhaustive()
    }
}

impl TransactionContext {
    pub fn new(transport: std::sync::Arc<dyn Transport>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transaction_id: None,
                in_local_transaction: false,
                in_net_transaction: false,
                synchronizations: Vec::new(),
                next_tx_ordinal: 1,
            }),
            transport,
        }
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner.lock().unwrap().transaction_id.clone()
    }

    pub fn in_local_transaction(&self) -> bool { self.inner.lock().unwrap().in_local_transaction }

    pub fn in_net_transaction(&self) -> bool { self.inner.lock().unwrap().in_net_transaction }

    pub fn set_in_net_transaction(&self, value: bool) {
        self.inner.lock().unwrap().in_net_transaction = value;
    }

    /// Start a new local transaction. Idempotent while one is already
    /// active — returns the existing id.
    #[instrument(skip(self))]
    pub fn begin(&self, connection_id: &crate::ids::ConnectionId) -> Result<TransactionId> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = &inner.transaction_id {
            return Ok(existing.clone());
        }
        let ordinal = inner.next_tx_ordinal;
        inner.next_tx_ordinal += 1;
        let id = TransactionId(format!("{connection_id}:TX:{ordinal}"));
        self.transport.oneway(Command::TransactionInfo(TransactionInfo {
            transaction_id: id.clone(),
            transaction_type: TransactionType::Begin,
        }))?;
        inner.transaction_id = Some(id.clone());
        inner.in_local_transaction = true;
        Ok(id)
    }

    /// Register a synchronization for `owner`. A second registration from
    /// the same owner while one is already pending is silently ignored.
    pub fn add_synchronization(&self, owner: SynchronizationOwner, sync: Synchronization) {
        let mut inner = self.inner.lock().unwrap();
        if inner.synchronizations.iter().any(|(existing, _)| *existing == owner) {
            return;
        }
        inner.synchronizations.push((owner, sync));
    }

    /// A `before_end`/`after_commit`/`after_rollback` hook may call back into
    /// this same `TransactionContext` (e.g. to read `transaction_id()` while
    /// building its own ack), so the lock must not be held while a callback
    /// runs — hence the take-snapshot-then-release dance below rather than
    /// iterating `inner.synchronizations` under the guard.
    #[instrument(skip(self))]
    pub fn commit(&self) -> Result<()> {
        let (transaction_id, mut synchronizations) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.in_local_transaction {
                return Err(Error::InvalidOperation("commit called outside a transaction".into()));
            }
            let transaction_id =
                inner.transaction_id.clone().expect("in_local_transaction implies an id");
            (transaction_id, std::mem::take(&mut inner.synchronizations))
        };

        for (_, sync) in &mut synchronizations {
            if let Some(before_end) = sync.before_end.as_mut() {
                before_end();
            }
        }

        let result = self.transport.sync_request(
            Command::TransactionInfo(TransactionInfo {
                transaction_id: transaction_id.clone(),
                transaction_type: TransactionType::CommitOnePhase,
            }),
            None,
        );

        let outcome = match result {
            Ok(_) => {
                for (_, sync) in &mut synchronizations {
                    if let Some(after_commit) = sync.after_commit.as_mut() {
                        after_commit();
                    }
                }
                Ok(())
            }
            Err(err) => {
                warn!(%err, "broker rejected commit, rolling back transaction locally");
                for (_, sync) in &mut synchronizations {
                    if let Some(after_rollback) = sync.after_rollback.as_mut() {
                        after_rollback();
                    }
                }
                Err(Error::BrokerRejection(format!("commit rejected: {err}")))
            }
        };

        let mut inner = self.inner.lock().unwrap();
        inner.transaction_id = None;
        inner.in_local_transaction = false;
        outcome
    }

    #[instrument(skip(self))]
    pub fn rollback(&self) -> Result<()> {
        let (transaction_id, mut synchronizations) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.in_local_transaction {
                return Err(Error::InvalidOperation("rollback called outside a transaction".into()));
            }
            let transaction_id =
                inner.transaction_id.clone().expect("in_local_transaction implies an id");
            (transaction_id, std::mem::take(&mut inner.synchronizations))
        };

        for (_, sync) in &mut synchronizations {
            if let Some(before_end) = sync.before_end.as_mut() {
                before_end();
            }
        }

        if let Err(err) = self.transport.oneway(Command::TransactionInfo(TransactionInfo {
            transaction_id,
            transaction_type: TransactionType::Rollback,
        })) {
            warn!(%err, "failed to send rollback to broker");
        }

        for (_, sync) in &mut synchronizations {
            if let Some(after_rollback) = sync.after_rollback.as_mut() {
                after_rollback();
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.transaction_id = None;
        inner.in_local_transaction = false;
        Ok(())
    }
}
