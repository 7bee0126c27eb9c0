//! Fixed-size worker pool running async function bodies
//!
//! Work is queued on a bounded `crossbeam-channel`. What happens when the queue
//! is full is decided by [`QueuePolicy`]: `Block` parks the submitter until a
//! worker frees a slot, `Reject` fails the submission with a range error. Jobs
//! are never dropped silently.
//!
//! Workers submit too: an async body calls another async function, and a
//! promise settled on a worker reschedules the bodies awaiting it. Under
//! `Block` a worker never parks on a full queue, since every worker could end
//! up waiting for a slot only a worker can free. Its job is handed to a
//! short-lived thread that blocks in its place.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, info_span, warn};

use crate::config::QueuePolicy;
use crate::error::{VmError, VmResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Workers run nested interpreter loops, which recurse on the native stack
const WORKER_STACK_BYTES: usize = 8 * 1024 * 1024;

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl PoolStats {
    /// Jobs accepted into the queue
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Jobs that finished running
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Jobs refused because the queue was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// A fixed set of worker threads fed from a bounded queue
pub struct ThreadPool {
    job_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    policy: QueuePolicy,
    stats: Arc<PoolStats>,
}

impl ThreadPool {
    /// Start `workers` threads sharing a queue of `queue_depth` jobs
    pub fn new(workers: usize, queue_depth: usize, policy: QueuePolicy) -> VmResult<Self> {
        let (job_tx, job_rx) = bounded::<Job>(queue_depth.max(1));
        let stats = Arc::new(PoolStats::default());

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = job_rx.clone();
            let worker_stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("kestrel-pool-{i}"))
                .stack_size(WORKER_STACK_BYTES)
                .spawn(move || run_worker(rx, worker_stats))
                .map_err(|e| VmError::fatal(format!("failed to spawn pool worker: {e}")))?;
            handles.push(handle);
        }

        let worker_ids = handles.iter().map(|h| h.thread().id()).collect();
        debug!(workers = handles.len(), queue_depth, ?policy, "thread pool started");

        Ok(Self {
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(handles),
            worker_ids,
            policy,
            stats,
        })
    }

    /// Queue a job according to the pool's [`QueuePolicy`]
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> VmResult<()> {
        let tx = self
            .job_tx
            .lock()
            .clone()
            .ok_or_else(|| VmError::fatal("thread pool is shut down"))?;
        let job: Job = Box::new(job);

        match self.policy {
            QueuePolicy::Block if self.on_worker() => match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => hand_off(tx, job)?,
                Err(TrySendError::Disconnected(_)) => {
                    return Err(VmError::fatal("thread pool workers have exited"));
                }
            },
            QueuePolicy::Block => tx
                .send(job)
                .map_err(|_| VmError::fatal("thread pool workers have exited"))?,
            QueuePolicy::Reject => match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("thread pool queue is full; job rejected");
                    return Err(VmError::range("thread pool queue is full"));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(VmError::fatal("thread pool workers have exited"));
                }
            },
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_worker(&self) -> bool {
        self.worker_ids.contains(&std::thread::current().id())
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.worker_ids.len()
    }

    /// Queue-full behavior
    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Pool counters
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Close the queue and wait for queued jobs to drain
    pub fn shutdown(&self) {
        self.job_tx.lock().take();

        // A worker cannot join itself
        if self.on_worker() {
            return;
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Queue `job` from a helper thread that may block on the full queue
fn hand_off(tx: Sender<Job>, job: Job) -> VmResult<()> {
    debug!("thread pool queue is full; handing job off from worker");
    std::thread::Builder::new()
        .name("kestrel-pool-handoff".to_string())
        .spawn(move || {
            if tx.send(job).is_err() {
                warn!("thread pool shut down before a handed-off job was queued");
            }
        })
        .map(drop)
        .map_err(|e| VmError::fatal(format!("failed to spawn pool hand-off thread: {e}")))
}

fn run_worker(job_rx: Receiver<Job>, stats: Arc<PoolStats>) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("kestrel-pool")
        .to_string();
    let _span = info_span!("worker", name = %thread_name).entered();
    debug!("worker starting");

    while let Ok(job) = job_rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("pool job panicked");
        }
        stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    debug!("worker stopped");
}
