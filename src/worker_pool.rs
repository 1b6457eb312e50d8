//! Bounded worker pool executing handler invocations off the scheduling and receive threads.
//!
//! Jobs travel over a crossbeam channel to a fixed set of named worker threads. Submission
//! never blocks: with no backlog limit the channel is unbounded, otherwise a full backlog
//! rejects the job and counts it. Closing the pool drops the only sender, so workers exit as
//! soon as the channel is empty (or immediately skip what is left under
//! [`ShutdownPolicy::DiscardPending`]).

use crate::config::{ShutdownPolicy, WorkerPoolConfig};
use crate::error::DispatchError;
use crate::handler::panic_message;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Unit of work run by a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

/// Snapshot of the pool's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    /// Jobs queued but not yet picked up by a worker.
    pub pending: usize,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    /// Jobs refused because the backlog was full or the pool was closed.
    pub rejected: u64,
    /// Queued jobs dropped at shutdown under `DiscardPending`.
    pub discarded: u64,
}

/// Fixed-size pool of worker threads fed by a job channel.
pub struct WorkerPool {
    /// `None` once the pool is closed
    sender: RwLock<Option<Sender<Job>>>,
    /// Kept only to report the backlog length
    receiver: Receiver<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
    /// Set on close under `DiscardPending`; workers then skip queued jobs
    discarding: Arc<AtomicBool>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Spawn the worker threads.
    ///
    /// # Arguments
    /// * `config` - worker count, backlog limit, shutdown policy and thread name prefix
    ///
    /// # Returns
    /// A running pool whose workers are named `<prefix>-worker-<n>`.
    ///
    /// # Errors
    /// [`DispatchError::Spawn`] if the OS refuses a thread. Workers spawned before the
    /// failure exit on their own once the channel sender is dropped.
    pub fn start(config: WorkerPoolConfig) -> Result<Self, DispatchError> {
        let (sender, receiver) = match config.backlog_limit {
            // A zero-capacity channel would be a rendezvous channel, not a backlog.
            Some(limit) => bounded(limit.max(1)),
            None => unbounded(),
        };
        let counters = Arc::new(PoolCounters::default());
        let discarding = Arc::new(AtomicBool::new(false));

        let worker_count = config.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let name = format!("{}-worker-{}", config.thread_name_prefix, worker_id);
            let worker_rx = receiver.clone();
            let worker_counters = counters.clone();
            let worker_discarding = discarding.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    worker_loop(worker_id, worker_rx, worker_counters, worker_discarding);
                })
                .map_err(|source| DispatchError::Spawn { name, source })?;
            handles.push(handle);
        }
        log::debug!(
            "worker pool started: {} workers, backlog limit {:?}",
            worker_count,
            config.backlog_limit
        );

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            handles: Mutex::new(handles),
            counters,
            discarding,
            config,
        })
    }

    /// Queue `job` for execution and return immediately.
    ///
    /// # Errors
    /// [`DispatchError::Backlogged`] when the backlog limit is reached,
    /// [`DispatchError::PoolClosed`] after [`WorkerPool::close`].
    pub fn submit<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            self.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(DispatchError::PoolClosed);
        };
        match sender.try_send(Box::new(job)) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                Err(DispatchError::Backlogged {
                    limit: self.receiver.capacity().unwrap_or(usize::MAX),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                Err(DispatchError::PoolClosed)
            }
        }
    }

    /// Stop accepting work. Returns `false` if the pool was already closed.
    ///
    /// Does not wait for the workers; see [`WorkerPool::shutdown`].
    pub fn close(&self) -> bool {
        let Some(sender) = self.sender.write().take() else {
            return false;
        };
        if self.config.shutdown_policy == ShutdownPolicy::DiscardPending {
            self.discarding.store(true, AtomicOrdering::Release);
        }
        drop(sender);
        log::debug!(
            "worker pool closed with {} pending jobs ({:?})",
            self.receiver.len(),
            self.config.shutdown_policy
        );
        true
    }

    /// Close the pool and wait for every worker to exit.
    pub fn shutdown(&self) {
        self.close();
        self.join();
    }

    /// Wait for every worker to exit; only returns once the pool has been closed.
    ///
    /// A worker calling this (from inside a handler) is skipped rather than joined.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{name} exited by panic");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Jobs queued but not yet started.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.config.workers.max(1),
            pending: self.receiver.len(),
            submitted: self.counters.submitted.load(AtomicOrdering::Relaxed),
            completed: self.counters.completed.load(AtomicOrdering::Relaxed),
            panicked: self.counters.panicked.load(AtomicOrdering::Relaxed),
            rejected: self.counters.rejected.load(AtomicOrdering::Relaxed),
            discarded: self.counters.discarded.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker loop: run jobs until the channel is closed and drained.
fn worker_loop(
    worker_id: usize,
    receiver: Receiver<Job>,
    counters: Arc<PoolCounters>,
    discarding: Arc<AtomicBool>,
) {
    log::debug!("worker {worker_id} started");
    // recv() keeps returning queued jobs after the sender is dropped and only errors once
    // the channel is both disconnected and empty.
    while let Ok(job) = receiver.recv() {
        if discarding.load(AtomicOrdering::Acquire) {
            counters.discarded.fetch_add(1, AtomicOrdering::Relaxed);
            continue;
        }
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                counters.completed.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, AtomicOrdering::Relaxed);
                log::error!(
                    "worker {worker_id}: job panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
    log::debug!("worker {worker_id} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded as channel, Receiver as Rx};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn pool(workers: usize, backlog_limit: Option<usize>, policy: ShutdownPolicy) -> WorkerPool {
        WorkerPool::start(WorkerPoolConfig {
            workers,
            backlog_limit,
            shutdown_policy: policy,
            thread_name_prefix: "test".to_string(),
        })
        .expect("spawn workers")
    }

    /// Occupy the single worker until the returned sender is dropped or signalled.
    fn block_worker(pool: &WorkerPool) -> crossbeam_channel::Sender<()> {
        let (started_tx, started_rx): (_, Rx<()>) = channel(1);
        let (release_tx, release_rx) = channel::<()>(1);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("worker picked up the blocking job");
        release_tx
    }

    #[test]
    fn runs_every_submitted_job() {
        let pool = pool(4, None, ShutdownPolicy::Drain);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 100);
        let stats = pool.stats();
        assert_eq!(stats.submitted, 100);
        assert_eq!(stats.completed, 100);
        assert_eq!(stats.workers, 4);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = pool(1, None, ShutdownPolicy::Drain);
        let (tx, rx) = channel(1);
        pool.submit(|| panic!("handler exploded")).unwrap();
        pool.submit(move || tx.send(42).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        pool.shutdown();
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn full_backlog_rejects_without_blocking() {
        let pool = pool(1, Some(1), ShutdownPolicy::Drain);
        let release = block_worker(&pool);

        pool.submit(|| {}).unwrap();
        let err = pool.submit(|| {}).unwrap_err();
        assert!(matches!(err, DispatchError::Backlogged { limit: 1 }));
        assert_eq!(pool.pending(), 1);

        release.send(()).unwrap();
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.completed, 2);
    }

    #[test]
    fn drain_policy_runs_queued_jobs_after_close() {
        let pool = pool(1, None, ShutdownPolicy::Drain);
        let release = block_worker(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .unwrap();
        }

        assert!(pool.close());
        assert!(!pool.close());
        release.send(()).unwrap();
        pool.shutdown();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 5);
    }

    #[test]
    fn discard_policy_drops_queued_jobs() {
        let pool = pool(1, None, ShutdownPolicy::DiscardPending);
        let release = block_worker(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .unwrap();
        }

        pool.close();
        release.send(()).unwrap();
        pool.shutdown();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
        let stats = pool.stats();
        assert_eq!(stats.discarded, 5);
        // The blocking job was already running and still completed.
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn submit_after_close_is_rejected() {
        let pool = pool(2, None, ShutdownPolicy::Drain);
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.submit(|| {}), Err(DispatchError::PoolClosed)));
        pool.shutdown();
    }

    #[test]
    fn zero_workers_still_spawns_one() {
        let pool = pool(0, None, ShutdownPolicy::Drain);
        let (tx, rx) = channel(1);
        pool.submit(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pool.stats().workers, 1);
        pool.shutdown();
    }
}
