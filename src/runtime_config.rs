//! # Runtime Configuration Module
//!
//! Environment variable-based configuration for the dispatcher and the
//! in-process job queue.
//!
//! ## Environment Variables
//!
//! ### Dispatcher
//!
//! - `AJAXD_NOTES_CACHE_TTL_SECS` - inactivity after which cached action
//!   metadata is dropped (default: 1800, i.e. 30 minutes)
//! - `AJAXD_CUSTOMIZER_MAX_PASSES` - passes over deferring customizers before
//!   the request fails (default: 64)
//! - `AJAXD_DEFAULT_FORMAT` - response format set on requests that carry none
//!   (default: `apiResponse`)
//!
//! ### Job queue
//!
//! - `AJAXD_JOB_WORKERS` - worker coroutines (default: 4)
//! - `AJAXD_JOB_MAX_REQUEST_AGE_MS` - how long a request waits for its job
//!   before it is answered with an enqueued handle (default: 10000)
//! - `AJAXD_JOB_STACK_SIZE` - worker coroutine stack size; decimal or `0x` hex
//!   (default: `0x40000`, 256 KB)
//!
//! ## Usage
//!
//! ```rust
//! use ajaxdispatch::runtime_config::{DispatcherConfig, JobQueueConfig};
//!
//! let config = DispatcherConfig::from_env();
//! let jobs = JobQueueConfig::from_env();
//! println!("notes ttl: {:?}, workers: {}", config.notes_ttl, jobs.num_workers);
//! ```

use std::env;
use std::time::Duration;

/// Default response format, applied when a request does not name one
pub const DEFAULT_FORMAT: &str = "apiResponse";

const DEFAULT_NOTES_TTL_SECS: u64 = 30 * 60;
const DEFAULT_CUSTOMIZER_MAX_PASSES: usize = 64;
const DEFAULT_JOB_WORKERS: usize = 4;
const DEFAULT_MAX_REQUEST_AGE_MS: u64 = 10_000;
const DEFAULT_JOB_STACK_SIZE: usize = 0x40000;
const DEFAULT_RESULT_RETENTION_MS: u64 = 5 * 60 * 1000;
/// Retention of `JobQueueConfig::new`, in multiples of the wait window
const RESULT_RETENTION_FACTOR: u32 = 10;

/// Parse a size that may be given in decimal or as `0x`-prefixed hex
fn parse_size(val: &str) -> Option<usize> {
    if let Some(hex) = val.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        val.parse().ok()
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Dispatcher tuning loaded from the environment
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cached action metadata expires after this much inactivity
    pub notes_ttl: Duration,
    /// Upper bound on customizer passes per direction and request
    pub customizer_max_passes: usize,
    /// Format assigned to requests without one
    pub default_format: String,
}

impl DispatcherConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            notes_ttl: Duration::from_secs(
                env_parsed("AJAXD_NOTES_CACHE_TTL_SECS").unwrap_or(DEFAULT_NOTES_TTL_SECS),
            ),
            customizer_max_passes: env_parsed("AJAXD_CUSTOMIZER_MAX_PASSES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_CUSTOMIZER_MAX_PASSES),
            default_format: env::var("AJAXD_DEFAULT_FORMAT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            notes_ttl: Duration::from_secs(DEFAULT_NOTES_TTL_SECS),
            customizer_max_passes: DEFAULT_CUSTOMIZER_MAX_PASSES,
            default_format: DEFAULT_FORMAT.to_string(),
        }
    }
}

/// Configuration for the in-process job queue
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Number of worker coroutines
    pub num_workers: usize,
    /// Wait budget before a request is answered with an enqueued handle
    pub max_request_age: Duration,
    /// Stack size for worker coroutines
    pub stack_size: usize,
    /// How long a finished, uncollected job result is kept for polling
    pub result_retention: Duration,
}

impl JobQueueConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            num_workers: env_parsed("AJAXD_JOB_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_JOB_WORKERS),
            max_request_age: Duration::from_millis(
                env_parsed("AJAXD_JOB_MAX_REQUEST_AGE_MS").unwrap_or(DEFAULT_MAX_REQUEST_AGE_MS),
            ),
            stack_size: env::var("AJAXD_JOB_STACK_SIZE")
                .ok()
                .and_then(|s| parse_size(s.trim()))
                .unwrap_or(DEFAULT_JOB_STACK_SIZE),
            result_retention: Duration::from_millis(
                env_parsed("AJAXD_JOB_RESULT_RETENTION_MS").unwrap_or(DEFAULT_RESULT_RETENTION_MS),
            ),
        }
    }

    /// Create a custom configuration; results are retained for ten wait windows
    #[must_use]
    pub fn new(num_workers: usize, max_request_age: Duration, stack_size: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            max_request_age,
            stack_size,
            result_retention: max_request_age.saturating_mul(RESULT_RETENTION_FACTOR),
        }
    }

    #[must_use]
    pub fn with_result_retention(mut self, retention: Duration) -> Self {
        self.result_retention = retention;
        self
    }
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_JOB_WORKERS,
            max_request_age: Duration::from_millis(DEFAULT_MAX_REQUEST_AGE_MS),
            stack_size: DEFAULT_JOB_STACK_SIZE,
            result_retention: Duration::from_millis(DEFAULT_RESULT_RETENTION_MS),
        }
    }
}
