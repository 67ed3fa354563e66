//! # Job Queue Module
//!
//! Offloading of long-running handler calls.
//!
//! The dispatcher talks to a [`JobQueue`] through a narrow contract:
//!
//! - [`JobQueue::contains`] - non-blocking check whether a job with a given
//!   deduplication key is running
//! - [`JobQueue::enqueue_and_wait`] - submit a job and wait a bounded time for
//!   its result; if the window elapses the caller gets
//!   [`EnqueueError::Enqueued`] with a [`JobInfo`] handle while the job keeps
//!   running in the background
//! - [`JobQueue::max_request_age`] - the wait budget the dispatcher uses
//!
//! Timeouts never abort jobs. A detached job's result is fetched later with
//! [`JobQueue::poll`].
//!
//! [`InProcessJobQueue`] implements the contract with a pool of `may`
//! coroutine workers.

mod core;
mod worker_pool;

pub use self::core::InProcessJobQueue;
pub use worker_pool::JobQueueMetrics;

use crate::error::{DispatchError, ErrorCode};
use crate::handler::JobKey;
use crate::ids::JobId;
use crate::request::CancellationToken;
use crate::result::AjaxResult;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Deferred work: produces exactly one result or fails
pub type JobWork = Box<dyn FnOnce() -> Result<AjaxResult, DispatchError> + Send + 'static>;

/// Client-visible handle of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub module: String,
    pub action: String,
    pub user_id: i32,
    pub context_id: i32,
    /// Submission time, epoch millis
    pub submitted: i64,
}

impl JobInfo {
    /// JSON payload of an enqueued result
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "job": self.id.to_string(), "info": self })
    }
}

/// A unit of deferred work
pub struct Job {
    id: JobId,
    key: Option<JobKey>,
    module: String,
    action: String,
    user_id: i32,
    context_id: i32,
    work: JobWork,
}

impl Job {
    pub fn new(
        module: impl Into<String>,
        action: impl Into<String>,
        session: &Session,
        work: JobWork,
    ) -> Self {
        Self {
            id: JobId::new(),
            key: None,
            module: module.into(),
            action: action.into(),
            user_id: session.user_id(),
            context_id: session.context_id(),
            work,
        }
    }

    /// Deduplication key; jobs without one are always unique
    #[must_use]
    pub fn with_key(mut self, key: Option<JobKey>) -> Self {
        self.key = key;
        self
    }

    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> Option<&JobKey> {
        self.key.as_ref()
    }

    #[must_use]
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            key: self.key.as_ref().map(ToString::to_string),
            module: self.module.clone(),
            action: self.action.clone(),
            user_id: self.user_id,
            context_id: self.context_id,
            submitted: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub(crate) fn into_work(self) -> JobWork {
        self.work
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("module", &self.module)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Why `enqueue_and_wait` did not produce a result
#[derive(Debug)]
pub enum EnqueueError {
    /// The wait window elapsed; the job continues in the background
    Enqueued(JobInfo),
    /// A job with the same key is running
    AlreadyRunning(JobId),
    /// The caller was cancelled while waiting; the job continues
    Interrupted(JobId),
    /// The job ran and failed, or could not be submitted
    Failed(DispatchError),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Enqueued(info) => write!(f, "job {} not completed in time", info.id),
            EnqueueError::AlreadyRunning(id) => write!(f, "job {id} already running"),
            EnqueueError::Interrupted(id) => write!(f, "interrupted while waiting for job {id}"),
            EnqueueError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EnqueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnqueueError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Structured error for a rejected duplicate job
#[must_use]
pub fn already_running(id: JobId, session: &Session) -> DispatchError {
    DispatchError::new(ErrorCode::AlreadyRunning)
        .with_arg(id.to_string())
        .with_arg(session.user_id().to_string())
        .with_arg(session.context_id().to_string())
}

/// State of a job looked up by id
#[derive(Debug)]
pub enum JobStatus {
    /// Still queued or executing
    Pending,
    /// Finished; the result is handed out once
    Done(Result<AjaxResult, DispatchError>),
    /// Never submitted, or its result was already collected
    Unknown,
}

/// Job queue contract required by the dispatcher
pub trait JobQueue: Send + Sync {
    /// Id of the running job registered under `key`
    fn contains(&self, key: &JobKey) -> Option<JobId>;

    /// Submit `job` and wait up to `max_wait` for its result.
    ///
    /// Waiting observes `cancellation`; cancellation returns
    /// [`EnqueueError::Interrupted`] without cancelling the job.
    fn enqueue_and_wait(
        &self,
        job: Job,
        max_wait: Duration,
        cancellation: &CancellationToken,
    ) -> Result<AjaxResult, EnqueueError>;

    /// Wait budget for enqueued requests
    fn max_request_age(&self) -> Duration;

    /// Collect the result of a detached job
    fn poll(&self, id: JobId) -> JobStatus;
}
