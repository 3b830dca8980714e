//! The bounded, closeable mailbox a session hands each consumer.
//!
//! Unlike a plain MPSC channel, a dispatch channel needs to be stopped,
//! drained and closed out of band of its producer/consumer ends, and needs
//! head-of-line reinsertion for rollback redelivery. That combination
//! doesn't fit a library channel, so this is built directly on `Mutex` +
//! `Condvar`, the way a blocking queue with cancellation is usually built in
//! Rust.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::command::MessageDispatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Running,
    Stopped,
    Closed,
}

struct Inner {
    state: ChannelState,
    queue: VecDeque<MessageDispatch>,
}

/// FIFO, priority-blind dispatch channel.
///
/// A session creates one per consumer. `enqueue` is called from the
/// session's inbound routing path; `dequeue` is called from the consumer's
/// `receive()` or from the session executor's listener pump.
pub struct DispatchChannel {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl std::fmt::Debug for DispatchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchChannel").finish_non_exhaustive()
    }
}

impl Default for DispatchChannel {
    fn default() -> Self { Self::new() }
}

impl DispatchChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { state: ChannelState::Running, queue: VecDeque::new() }),
            ready: Condvar::new(),
        }
    }

    /// Append at the tail. No-op once the channel is closed.
    pub fn enqueue(&self, dispatch: MessageDispatch) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Closed {
            return;
        }
        inner.queue.push_back(dispatch);
        self.ready.notify_one();
    }

    /// Push back at the head; used to redeliver a message ahead of whatever
    /// already arrived after it (rollback, listener reattachment).
    pub fn enqueue_first(&self, dispatch: MessageDispatch) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Closed {
            return;
        }
        inner.queue.push_front(dispatch);
        self.ready.notify_one();
    }

    /// Block for up to `timeout` for the next dispatch. Returns `None` if
    /// the channel is stopped/closed and empty, or if nothing arrived
    /// before the timeout elapsed. A dispatch whose `message` is `None` is
    /// always a close sentinel: it is returned once so the caller can stop
    /// waiting, not retried.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if inner.state != ChannelState::Running {
                return None;
            }
            if let Some(dispatch) = inner.queue.pop_front() {
                return if dispatch.is_close_sentinel() { None } else { Some(dispatch) };
            }
            match deadline {
                None => inner = self.ready.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, timeout_result) =
                        self.ready.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                    if timeout_result.timed_out() && inner.queue.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    /// Non-blocking `dequeue`.
    pub fn dequeue_no_wait(&self) -> Option<MessageDispatch> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ChannelState::Running {
            return None;
        }
        match inner.queue.pop_front() {
            Some(dispatch) if !dispatch.is_close_sentinel() => Some(dispatch),
            _ => None,
        }
    }

    /// Drain every pending dispatch, oldest first; used when clearing
    /// messages in progress on a transport interrupt.
    pub fn remove_all(&self) -> Vec<MessageDispatch> {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.drain(..).collect()
    }

    /// Discard everything queued without returning it.
    pub fn clear(&self) { self.inner.lock().unwrap().queue.clear(); }

    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Stopped {
            inner.state = ChannelState::Running;
        }
        self.ready.notify_all();
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Running {
            inner.state = ChannelState::Stopped;
        }
        self.ready.notify_all();
    }

    /// Stop taking new work and wake every blocked waiter for good; no
    /// further `enqueue` will have any effect.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ChannelState::Closed;
        inner.queue.clear();
        self.ready.notify_all();
    }

    pub fn count(&self) -> usize { self.inner.lock().unwrap().queue.len() }

    pub fn is_empty(&self) -> bool { self.count() == 0 }

    pub fn is_running(&self) -> bool { self.inner.lock().unwrap().state == ChannelState::Running }
}

/// The common surface both dispatch-channel flavours expose. `MessageConsumer`
/// holds one as `Box<dyn DispatchQueue>`, picked at construction time by the
/// connection's "priority supported" flag.
pub trait DispatchQueue: Send + Sync {
    fn enqueue(&self, dispatch: MessageDispatch);
    fn enqueue_first(&self, dispatch: MessageDispatch);
    fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch>;
    fn dequeue_no_wait(&self) -> Option<MessageDispatch>;
    fn remove_all(&self) -> Vec<MessageDispatch>;
    fn clear(&self);
    fn start(&self);
    fn stop(&self);
    fn close(&self);
    fn count(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn is_running(&self) -> bool;
}

impl DispatchQueue for DispatchChannel {
    fn enqueue(&self, dispatch: MessageDispatch) { DispatchChannel::enqueue(self, dispatch) }
    fn enqueue_first(&self, dispatch: MessageDispatch) {
        DispatchChannel::enqueue_first(self, dispatch)
    }
    fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        DispatchChannel::dequeue(self, timeout)
    }
    fn dequeue_no_wait(&self) -> Option<MessageDispatch> { DispatchChannel::dequeue_no_wait(self) }
    fn remove_all(&self) -> Vec<MessageDispatch> { DispatchChannel::remove_all(self) }
    fn clear(&self) { DispatchChannel::clear(self) }
    fn start(&self) { DispatchChannel::start(self) }
    fn stop(&self) { DispatchChannel::stop(self) }
    fn close(&self) { DispatchChannel::close(self) }
    fn count(&self) -> usize { DispatchChannel::count(self) }
    fn is_empty(&self) -> bool { DispatchChannel::is_empty(self) }
    fn is_running(&self) -> bool { DispatchChannel::is_running(self) }
}

const PRIORITY_LEVELS: usize = 10;

struct PriorityInner {
    state:   ChannelState,
    buckets: [VecDeque<MessageDispatch>; PRIORITY_LEVELS],
}

impl PriorityInner {
    fn bucket_index(dispatch: &MessageDispatch) -> usize {
        dispatch
            .message
            .as_ref()
            .map(|m| m.priority.min((PRIORITY_LEVELS - 1) as u8) as usize)
            .unwrap_or(crate::command::Message::DEFAULT_PRIORITY as usize)
    }

    fn len(&self) -> usize { self.buckets.iter().map(VecDeque::len).sum() }

    fn pop_highest(&mut self) -> Option<MessageDispatch> {
        self.buckets.iter_mut().rev().find_map(VecDeque::pop_front)
    }
}

/// Ten internal FIFO sub-queues indexed by JMS message priority (0..9,
/// default 4). `dequeue` always returns the highest-priority message
/// available; within a priority level, arrival order is preserved.
pub struct PriorityDispatchChannel {
    inner: Mutex<PriorityInner>,
    ready: Condvar,
}

impl std::fmt::Debug for PriorityDispatchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityDispatchChannel").finish_non_exhaustive()
    }
}

impl Default for PriorityDispatchChannel {
    fn default() -> Self { Self::new() }
}

impl PriorityDispatchChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PriorityInner {
                state:   ChannelState::Running,
                buckets: Default::default(),
            }),
            ready: Condvar::new(),
        }
    }
}

impl DispatchQueue for PriorityDispatchChannel {
    fn enqueue(&self, dispatch: MessageDispatch) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Closed {
            return;
        }
        let index = PriorityInner::bucket_index(&dispatch);
        inner.buckets[index].push_back(dispatch);
        self.ready.notify_one();
    }

    fn enqueue_first(&self, dispatch: MessageDispatch) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Closed {
            return;
        }
        let index = PriorityInner::bucket_index(&dispatch);
        inner.buckets[index].push_front(dispatch);
        self.ready.notify_one();
    }

    fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if inner.state != ChannelState::Running {
                return None;
            }
            if let Some(dispatch) = inner.pop_highest() {
                return if dispatch.is_close_sentinel() { None } else { Some(dispatch) };
            }
            match deadline {
                None => inner = self.ready.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, timeout_result) =
                        self.ready.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                    if timeout_result.timed_out() && inner.len() == 0 {
                        return None;
                    }
                }
            }
        }
    }

    fn dequeue_no_wait(&self) -> Option<MessageDispatch> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ChannelState::Running {
            return None;
        }
        match inner.pop_highest() {
            Some(dispatch) if !dispatch.is_close_sentinel() => Some(dispatch),
            _ => None,
        }
    }

    fn remove_all(&self) -> Vec<MessageDispatch> {
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.iter_mut().rev().flat_map(|bucket| bucket.drain(..)).collect()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for bucket in &mut inner.buckets {
            bucket.clear();
        }
    }

    fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Stopped {
            inner.state = ChannelState::Running;
        }
        self.ready.notify_all();
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ChannelState::Running {
            inner.state = ChannelState::Stopped;
        }
        self.ready.notify_all();
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ChannelState::Closed;
        for bucket in &mut inner.buckets {
            bucket.clear();
        }
        self.ready.notify_all();
    }

    fn count(&self) -> usize { self.inner.lock().unwrap().len() }

    fn is_empty(&self) -> bool { self.count() == 0 }

    fn is_running(&self) -> bool { self.inner.lock().unwrap().state == ChannelState::Running }
}
