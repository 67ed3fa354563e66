//! Coroutine worker pool executing queued jobs.
//!
//! Workers share one unbounded `may` channel and pull tasks from it, so load
//! is balanced automatically. Every task runs under panic recovery; a
//! panicking task never takes its worker down.

use crate::error::DispatchError;
use crate::runtime_config::JobQueueConfig;
use may::sync::mpsc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Unit of work handed to a worker
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Metrics of a job queue
#[derive(Debug, Default)]
pub struct JobQueueMetrics {
    /// Total jobs handed to workers
    pub dispatched_count: AtomicU64,
    /// Total jobs finished (including failed and panicked ones)
    pub completed_count: AtomicU64,
    /// Jobs queued or executing right now
    pub running: AtomicUsize,
    /// Waits that ended before their job finished
    pub timed_out_count: AtomicU64,
    /// Waits aborted by cancellation
    pub interrupted_count: AtomicU64,
    /// Submissions rejected because their key was already running
    pub rejected_count: AtomicU64,
}

impl JobQueueMetrics {
    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupted_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_timed_out_count(&self) -> u64 {
        self.timed_out_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_interrupted_count(&self) -> u64 {
        self.interrupted_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }
}

pub(crate) struct WorkerPool {
    sender: mpsc::Sender<Task>,
    metrics: Arc<JobQueueMetrics>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` worker coroutines.
    ///
    /// # Safety
    ///
    /// Spawns coroutines with `may::coroutine::Builder::spawn()`, which is
    /// unsafe in the `may` runtime. The caller must ensure the runtime is
    /// configured before the first pool is created.
    pub(crate) unsafe fn new(config: &JobQueueConfig, metrics: Arc<JobQueueMetrics>) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(rx);

        info!(
            num_workers = config.num_workers,
            stack_size = config.stack_size,
            max_request_age_ms = config.max_request_age.as_millis() as u64,
            "Creating job worker pool"
        );

        for worker_id in 0..config.num_workers {
            let rx = Arc::clone(&rx);
            let metrics = Arc::clone(&metrics);

            let spawn_result = may::coroutine::Builder::new()
                .name(format!("ajax-job-{worker_id}"))
                .stack_size(config.stack_size)
                .spawn(move || {
                    debug!(worker_id = worker_id, "Job worker started");
                    while let Ok(task) = rx.recv() {
                        if let Err(panic) =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(task))
                        {
                            error!(
                                worker_id = worker_id,
                                panic_message = ?panic,
                                "Job task panicked"
                            );
                        }
                        metrics.record_completion();
                    }
                    debug!(worker_id = worker_id, "Job worker exiting");
                });

            if let Err(e) = spawn_result {
                error!(worker_id = worker_id, error = %e, "Failed to spawn job worker");
            }
        }

        Self { sender: tx, metrics }
    }

    /// Hand `task` to the workers
    pub(crate) fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        self.metrics.record_dispatch();
        if self.sender.send(task).is_err() {
            self.metrics.record_completion();
            error!("Job worker channel disconnected");
            return Err(DispatchError::unexpected("Job workers are not running"));
        }
        Ok(())
    }
}
