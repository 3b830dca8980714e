//! A single-thread deferred-execution service for redelivery delays.
//!
//! A rolled-back transacted consumer needs to redispatch a message after a
//! delay without blocking the session executor that owns it. Rather than
//! spawning a detached sleeping task per message (which can't be cancelled
//! once the owning consumer closes), every delayed job runs through one
//! worker thread that a `TimerService::shutdown` can join.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    id:   u64,
    due:  Instant,
    job:  Job,
}

enum Command {
    Schedule(Scheduled),
    Cancel(u64),
    Shutdown,
}

/// A handle returned by [`TimerService::schedule`]; drop it or call
/// [`TimerHandle::cancel`] to stop the job from running.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    tx: mpsc::Sender<Command>,
}

impl TimerHandle {
    pub fn cancel(&self) { let _ = self.tx.send(Command::Cancel(self.id)); }
}

/// One background worker thread, fed through a channel, that runs each
/// scheduled job at its due time and nothing before it.
pub struct TimerService {
    tx:          mpsc::Sender<Command>,
    next_id:     AtomicU64,
    worker:      Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService").finish_non_exhaustive()
    }
}

impl TimerService {
    pub fn start() -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name("amq-timer".into())
            .spawn(move || Self::run(rx))
            .expect("failed to spawn timer worker thread");
        Arc::new(Self { tx, next_id: AtomicU64::new(1), worker: Mutex::new(Some(worker)) })
    }

    /// Run `job` once, after `delay`. Returns a handle that cancels it.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;
        let _ = self.tx.send(Command::Schedule(Scheduled { id, due, job: Box::new(job) }));
        TimerHandle { id, tx: self.tx.clone() }
    }

    /// Stop the worker thread and drop any jobs still pending.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    fn run(rx: mpsc::Receiver<Command>) {
        let mut pending: Vec<Scheduled> = Vec::new();
        loop {
            let timeout = pending
                .iter()
                .map(|s| s.due)
                .min()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));

            match rx.recv_timeout(timeout) {
                Ok(Command::Schedule(scheduled)) => pending.push(scheduled),
                Ok(Command::Cancel(id)) => pending.retain(|s| s.id != id),
                Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].due <= now {
                    let scheduled = pending.remove(i);
                    (scheduled.job)();
                } else {
                    i += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn schedule_runs_after_the_delay() {
        let timer = TimerService::start();
        let (tx, rx) = std_mpsc::channel();
        timer.schedule(Duration::from_millis(20), move || {
            let _ = tx.send(42);
        });
        let value = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(value, 42);
        timer.shutdown();
    }

    #[test]
    fn cancel_prevents_the_job_from_running() {
        let timer = TimerService::start();
        let (tx, rx) = std_mpsc::channel();
        let handle = timer.schedule(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        timer.shutdown();
    }
}
