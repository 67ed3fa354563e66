use super::worker_pool::{JobQueueMetrics, Task, WorkerPool};
use super::{EnqueueError, Job, JobInfo, JobQueue, JobStatus};
use crate::error::DispatchError;
use crate::handler::JobKey;
use crate::ids::JobId;
use crate::request::CancellationToken;
use crate::result::AjaxResult;
use crate::runtime_config::JobQueueConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Longest uninterrupted wait; cancellation is observed at this granularity
const WAIT_SLICE: Duration = Duration::from_millis(10);

type Outcome = Result<AjaxResult, DispatchError>;

/// Completion slot of one job
struct JobSlot {
    outcome: Mutex<Option<Outcome>>,
    finished_at: Mutex<Option<Instant>>,
    done: Condvar,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            finished_at: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Outcome) {
        *self.finished_at.lock() = Some(Instant::now());
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn is_done(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Finished before `cutoff`
    fn finished_before(&self, cutoff: Instant) -> bool {
        self.finished_at.lock().is_some_and(|at| at < cutoff)
    }

    /// Wait until the job completes, `deadline` passes or `cancellation` fires
    fn wait(&self, deadline: Instant, cancellation: &CancellationToken) -> Wait {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(done) = outcome.take() {
                return Wait::Done(done);
            }
            if cancellation.is_cancelled() {
                return Wait::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            self.done.wait_for(&mut outcome, slice);
        }
    }
}

enum Wait {
    Done(Outcome),
    TimedOut,
    Cancelled,
}

/// [`JobQueue`] executing jobs on `may` coroutine workers in this process.
///
/// The deduplication key is reserved when a job is submitted and released
/// when it completes, so two concurrent submissions with the same key can
/// never both execute. Results of jobs that outlived their wait window stay
/// in the queue until collected with [`JobQueue::poll`], or until they are
/// older than [`JobQueueConfig::result_retention`]; stale results are swept
/// whenever a job is submitted or polled.
pub struct InProcessJobQueue {
    config: JobQueueConfig,
    pool: WorkerPool,
    running: Arc<DashMap<JobKey, JobId>>,
    slots: Arc<DashMap<JobId, Arc<JobSlot>>>,
    metrics: Arc<JobQueueMetrics>,
}

impl InProcessJobQueue {
    /// Create the queue and spawn its workers.
    ///
    /// # Safety
    ///
    /// Spawns coroutines with `may::coroutine::Builder::spawn()`; see
    /// [`may::coroutine::Builder::spawn`] for the runtime requirements.
    pub unsafe fn new(config: JobQueueConfig) -> Self {
        let metrics = Arc::new(JobQueueMetrics::default());
        // SAFETY: forwarded to the caller of this function
        let pool = unsafe { WorkerPool::new(&config, Arc::clone(&metrics)) };
        Self {
            config,
            pool,
            running: Arc::new(DashMap::new()),
            slots: Arc::new(DashMap::new()),
            metrics,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &JobQueueMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Jobs whose results were not collected yet (including running ones)
    #[must_use]
    pub fn tracked_jobs(&self) -> usize {
        self.slots.len()
    }

    /// Drop results that finished longer than the retention period ago
    pub fn sweep_finished(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.config.result_retention) else {
            return;
        };
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.finished_before(cutoff));
        let swept = before.saturating_sub(self.slots.len());
        if swept > 0 {
            debug!(swept = swept, "Dropped uncollected job results");
        }
    }

    /// Reserve `key` for `id`; returns the holder if the key is taken
    fn reserve(&self, key: &JobKey, id: JobId) -> Result<(), JobId> {
        match self.running.entry(key.clone()) {
            Entry::Occupied(existing) => Err(*existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    fn task(&self, job: Job, slot: Arc<JobSlot>) -> Task {
        let id = job.id();
        let key = job.key().cloned();
        let running = Arc::clone(&self.running);
        let work = job.into_work();

        Box::new(move || {
            debug!(job_id = %id, "Job started");
            let outcome = catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|panic| {
                error!(job_id = %id, panic_message = ?panic, "Job panicked");
                Err(DispatchError::unexpected("job panicked"))
            });
            if let Some(key) = key {
                running.remove_if(&key, |_, holder| *holder == id);
            }
            debug!(job_id = %id, ok = outcome.is_ok(), "Job finished");
            slot.complete(outcome);
        })
    }
}

impl JobQueue for InProcessJobQueue {
    fn contains(&self, key: &JobKey) -> Option<JobId> {
        self.running.get(key).map(|id| *id)
    }

    fn enqueue_and_wait(
        &self,
        job: Job,
        max_wait: Duration,
        cancellation: &CancellationToken,
    ) -> Result<AjaxResult, EnqueueError> {
        self.sweep_finished();
        let id = job.id();
        let info: JobInfo = job.info();

        if let Some(key) = job.key() {
            if let Err(holder) = self.reserve(key, id) {
                self.metrics.record_rejection();
                debug!(job_id = %id, running_job = %holder, key = %key, "Job already running");
                return Err(EnqueueError::AlreadyRunning(holder));
            }
        }

        let key = job.key().cloned();
        let slot = Arc::new(JobSlot::new());
        self.slots.insert(id, Arc::clone(&slot));
        let task = self.task(job, Arc::clone(&slot));
        if let Err(e) = self.pool.dispatch(task) {
            self.slots.remove(&id);
            if let Some(key) = key {
                self.running.remove_if(&key, |_, holder| *holder == id);
            }
            return Err(EnqueueError::Failed(e));
        }

        match slot.wait(Instant::now() + max_wait, cancellation) {
            Wait::Done(outcome) => {
                self.slots.remove(&id);
                outcome.map_err(EnqueueError::Failed)
            }
            Wait::TimedOut => {
                self.metrics.record_timeout();
                debug!(
                    job_id = %id,
                    module = %info.module,
                    action = %info.action,
                    max_wait_ms = max_wait.as_millis() as u64,
                    "Job not completed in time; detached"
                );
                Err(EnqueueError::Enqueued(info))
            }
            Wait::Cancelled => {
                self.metrics.record_interrupt();
                warn!(job_id = %id, "Interrupted while waiting for job; job continues");
                Err(EnqueueError::Interrupted(id))
            }
        }
    }

    fn max_request_age(&self) -> Duration {
        self.config.max_request_age
    }

    fn poll(&self, id: JobId) -> JobStatus {
        self.sweep_finished();
        let Some(slot) = self.slots.get(&id).map(|s| Arc::clone(s.value())) else {
            return JobStatus::Unknown;
        };
        if !slot.is_done() {
            return JobStatus::Pending;
        }
        self.slots.remove(&id);
        let outcome = slot.outcome.lock().take();
        match outcome {
            Some(outcome) => JobStatus::Done(outcome),
            None => JobStatus::Unknown,
        }
    }
}
