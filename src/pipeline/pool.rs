//! Bounded worker pool for the capture path

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use flume::{Sender, TrySendError};
use tracing::{debug, error, warn};

/// A unit of work queued on the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads fed from a bounded queue.
///
/// Submitting never spawns: when the queue is full the caller gets the job back
/// and decides whether to drop it or run it itself.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,

    /// Statistics
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    jobs_submitted: AtomicUsize,
    jobs_completed: AtomicUsize,
    jobs_rejected: AtomicUsize,
    jobs_panicked: AtomicUsize,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    pub rejected: usize,
    pub panicked: usize,
}

impl WorkerPool {
    /// Start `threads` workers sharing a queue of `queue_depth` jobs.
    ///
    /// With `pin_cores` each worker is pinned round-robin to the available cores.
    pub fn new(
        name: &str,
        threads: usize,
        queue_depth: usize,
        pin_cores: bool,
    ) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = flume::bounded::<Job>(queue_depth.max(1));
        let stats = Arc::new(CachePadded::new(Stats::default()));

        let cores = if pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let stats = Arc::clone(&stats);
            let core = if cores.is_empty() {
                None
            } else {
                Some(cores[index % cores.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            warn!("Unable to pin worker {} to core {:?}", index, core);
                        }
                    }

                    for job in receiver.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Worker {} job panicked", index);
                            stats.jobs_panicked.fetch_add(1, Ordering::Relaxed);
                        }
                        stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                    }
                })?;
            workers.push(handle);
        }

        debug!("Started pool {} with {} workers", name, threads);

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
            stats,
        })
    }

    /// Queue a job without blocking. A full or closed queue hands the job back.
    pub fn try_execute<F>(&self, job: F) -> Result<(), Job>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let Some(sender) = &self.sender else {
            return Err(job);
        };

        match sender.try_send(job) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                Err(job)
            }
        }
    }

    /// Queue a job, waiting for room. A closed queue hands the job back.
    pub fn execute<F>(&self, job: F) -> Result<(), Job>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let Some(sender) = &self.sender else {
            return Err(job);
        };

        match sender.send(job) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(flume::SendError(job)) => {
                self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                Err(job)
            }
        }
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, |sender| sender.len())
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.stats.jobs_submitted.load(Ordering::Relaxed),
            completed: self.stats.jobs_completed.load(Ordering::Relaxed),
            rejected: self.stats.jobs_rejected.load(Ordering::Relaxed),
            panicked: self.stats.jobs_panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers finish what is queued, then exit
        self.sender.take();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Pool {} worker exited abnormally", self.name);
            }
        }
    }
}
