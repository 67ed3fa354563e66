//! # ajaxdispatch
//!
//! **ajaxdispatch** is the request-dispatch pipeline behind an AJAX API: it takes an
//! already-authenticated request, resolves it to an action handler, runs cross-cutting
//! customizers around the call, optionally offloads long-running work to a job queue,
//! applies HTTP conditional semantics and turns every outcome into a uniform result or
//! structured error.
//!
//! ## Overview
//!
//! The pipeline is safe to drive from many request threads (or `may` coroutines) at
//! once. Registration happens at startup or plugin-load time; the per-request path only
//! reads lock-free snapshots and concurrent maps.
//!
//! ## Architecture
//!
//! - **[`registry`]** - Module name → action factory map with prefix fallback
//! - **[`customizer`]** - Incoming/outgoing hooks with deferral and bounded retries
//! - **[`dispatcher`]** - The orchestrator: [`Dispatcher::perform`]
//! - **[`job_queue`]** - Enqueue-and-wait contract and an in-process coroutine queue
//! - **[`rotating_list`]** - Copy-on-write list with a `rotate` primitive
//! - **[`session_history`]** - Bucketed recency buffer built on the rotating list
//! - **[`handler`]** - Action handler, factory and capability traits
//! - **[`request`]** / **[`result`]** - Request and result envelopes
//! - **[`error`]** - Structured error codes and categories
//! - **[`metrics`]** - Per module/action/status request metrics
//! - **[`otel`]** / **[`log_context`]** - Logging setup and request-scoped log context
//! - **[`runtime_config`]** - Environment-driven configuration
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Caller
//!     participant Dispatcher
//!     participant Customizers as CustomizerChain
//!     participant Registry as ActionRegistry
//!     participant Queue as JobQueue
//!     participant Handler as ActionHandler
//!
//!     Caller->>Dispatcher: perform(request, session)
//!     alt No session
//!         Dispatcher-->>Caller: MISSING_PARAMETER
//!     end
//!     Dispatcher->>Customizers: apply_incoming (registration order)
//!     Dispatcher->>Registry: resolve(module)
//!     alt Unknown module / action
//!         Dispatcher-->>Caller: UNKNOWN_MODULE / UNKNOWN_ACTION_IN_MODULE
//!     end
//!     Dispatcher->>Dispatcher: Conditional headers (412 / not modified)
//!     alt allow_enqueue and enqueueable
//!         Dispatcher->>Queue: enqueue_and_wait(job, max_request_age)
//!         Queue->>Handler: perform (worker coroutine)
//!         Queue-->>Dispatcher: result, or job handle on timeout
//!     else inline
//!         Dispatcher->>Handler: perform
//!     end
//!     Dispatcher->>Customizers: apply_outgoing (reverse order)
//!     Dispatcher-->>Caller: AjaxResult
//! ```
//!
//! ## Configuration
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `AJAXD_NOTES_CACHE_TTL_SECS` | `1800` | Lifetime of cached action notes |
//! | `AJAXD_CUSTOMIZER_MAX_PASSES` | `64` | Bound on customizer deferral passes |
//! | `AJAXD_DEFAULT_FORMAT` | `apiResponse` | Format set on requests without one |
//! | `AJAXD_JOB_WORKERS` | `4` | Job queue worker coroutines |
//! | `AJAXD_JOB_MAX_REQUEST_AGE_MS` | `10000` | Enqueue wait window |
//! | `AJAXD_JOB_STACK_SIZE` | `0x40000` | Worker coroutine stack size |
//! | `AJAXD_JOB_RESULT_RETENTION_MS` | `300000` | Retention of uncollected job results |
//!
//! Logging is configured through the `AJAXD_LOG_*` variables, see [`otel::LogConfig`].

pub mod body;
pub mod cli;
pub mod customizer;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod ids;
pub mod job_queue;
pub mod listener;
pub mod log_context;
pub mod metrics;
pub mod notes_cache;
pub mod otel;
pub mod registry;
pub mod request;
pub mod result;
pub mod rotating_list;
pub mod runtime_config;
pub mod session;
pub mod session_history;

pub use dispatcher::Dispatcher;
pub use error::{ActionError, Category, DispatchError, ErrorCode};
pub use handler::{ActionFactory, ActionHandler, ActionOutcome};
pub use job_queue::{InProcessJobQueue, JobQueue};
pub use request::AjaxRequest;
pub use result::AjaxResult;
pub use rotating_list::{ListError, RotatingList};
pub use session::Session;
pub use session_history::SessionHistory;
