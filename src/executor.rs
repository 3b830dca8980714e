//! The single-threaded, cooperative dispatch pump owned by each `Session`.
//!
//! JMS requires a session's listener calls to be serialized; this executor
//! is how that's enforced even though dispatches for many consumers on the
//! session flow through the same pump. It reuses `DispatchChannel` for its
//! internal queue — the close/stop semantics it already has are exactly
//! what a pump needs to pause for listener reattachment and stop for good
//! on session close.

use std::{
    collections::HashMap,
    sync::{
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{instrument, trace, warn};

use crate::{command::MessageDispatch, dispatch_channel::DispatchChannel, ids::ConsumerId};

/// Anything the executor can hand a dispatch to. `MessageConsumer`
/// implements this; the executor itself only knows about the trait so it
/// never needs to depend on the concrete consumer type.
pub trait DispatchTarget: Send + Sync {
    fn dispatch(&self, dispatch: MessageDispatch);
}

/// Every 1000 dispatches the pump yields briefly so one noisy session can't
/// starve others sharing the process.
const YIELD_EVERY: u64 = 1000;

struct Pump {
    channel: Arc<DispatchChannel>,
    targets: Arc<Mutex<HashMap<ConsumerId, Arc<dyn DispatchTarget>>>>,
}

impl Pump {
    fn run(self, done_tx: mpsc::Sender<()>) {
        let mut processed: u64 = 0;
        loop {
            match self.channel.dequeue(None) {
                None => break,
                Some(dispatch) => {
                    let target = self.targets.lock().unwrap().get(&dispatch.consumer_id).cloned();
                    match target {
                        Some(target) => target.dispatch(dispatch),
                        None => trace!(consumer_id = %dispatch.consumer_id, "dropping dispatch for unknown consumer"),
                    }
                    processed += 1;
                    if processed % YIELD_EVERY == 0 {
                        thread::yield_now();
                    }
                }
            }
        }
        let _ = done_tx.send(());
    }
}

/// Owns the session-wide dispatch queue and the one worker thread that
/// drains it.
pub struct SessionExecutor {
    channel: Arc<DispatchChannel>,
    targets: Arc<Mutex<HashMap<ConsumerId, Arc<dyn DispatchTarget>>>>,
    thread:  Mutex<Option<(JoinHandle<()>, mpsc::Receiver<()>)>>,
}

impl std::fmt::Debug for SessionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExecutor").field("running", &self.running()).finish()
    }
}

impl Default for SessionExecutor {
    fn default() -> Self { Self::new() }
}

impl SessionExecutor {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(DispatchChannel::new()),
            targets: Arc::new(Mutex::new(HashMap::new())),
            thread:  Mutex::new(None),
        }
    }

    /// Register (or replace) the dispatch target for `consumer_id`; called
    /// when a session creates a consumer.
    pub fn register(&self, consumer_id: ConsumerId, target: Arc<dyn DispatchTarget>) {
        self.targets.lock().unwrap().insert(consumer_id, target);
    }

    /// Drop the dispatch target for `consumer_id`; called on consumer
    /// close so in-flight dispatches for a removed consumer are dropped by
    /// the pump rather than panicking.
    pub fn unregister(&self, consumer_id: &ConsumerId) {
        self.targets.lock().unwrap().remove(consumer_id);
    }

    /// Append to the tail of the pump's queue.
    pub fn execute(&self, dispatch: MessageDispatch) { self.channel.enqueue(dispatch); }

    /// Prepend to the pump's queue; used for redispatch-at-head after a
    /// listener is attached or a transaction rolls back.
    pub fn execute_first(&self, dispatch: MessageDispatch) { self.channel.enqueue_first(dispatch); }

    #[instrument(skip(self))]
    pub fn start(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            self.channel.start();
            return;
        }
        self.channel.start();
        let pump = Pump { channel: self.channel.clone(), targets: self.targets.clone() };
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("amq-session-executor".into())
            .spawn(move || pump.run(done_tx))
            .expect("failed to spawn session executor thread");
        *thread = Some((handle, done_rx));
    }

    /// Stop the pump, waiting up to `timeout` (`None` = forever) for it to
    /// finish whatever it was doing. A subsequent `start()` spawns a fresh
    /// worker thread against the same queue.
    #[instrument(skip(self))]
    pub fn stop(&self, timeout: Option<Duration>) {
        self.channel.stop();
        let mut thread = self.thread.lock().unwrap();
        if let Some((handle, done_rx)) = thread.take() {
            let finished = match timeout {
                Some(timeout) => done_rx.recv_timeout(timeout).is_ok(),
                None => {
                    let _ = done_rx.recv();
                    true
                }
            };
            if !finished {
                warn!("session executor did not stop within the requested timeout");
            }
            let _ = handle.join();
        }
    }

    pub fn running(&self) -> bool {
        self.thread.lock().unwrap().is_some() && self.channel.is_running()
    }

    /// Drop every consumer's registration and permanently close the pump
    /// queue; used once, on session close.
    pub fn close(&self) {
        self.channel.close();
        self.stop(Some(Duration::from_secs(30)));
        self.targets.lock().unwrap().clear();
    }

    /// Wake a blocked pump without enqueuing anything, by nudging the
    /// channel's running state.
    pub fn wakeup(&self) { self.channel.start(); }
}
