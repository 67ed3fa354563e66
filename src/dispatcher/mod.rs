//! # Dispatcher Module
//!
//! [`Dispatcher::perform`] routes one request to its action handler.
//!
//! ## Request Flow
//!
//! 1. A request without a session is rejected with `MISSING_PARAMETER`
//! 2. Incoming customizer hooks run (registration order, deferring members retried)
//! 3. The module is resolved with prefix fallback, then the action within it;
//!    failures are `UNKNOWN_MODULE` / `UNKNOWN_ACTION_IN_MODULE`
//! 4. The body is loaded unless the action prefers to read the stream itself
//! 5. Conditional headers may short-circuit with a 412 or not-modified result
//! 6. Annotation processors that handle the action run
//! 7. With `allow_enqueue=true` and an enqueueable action, the call goes to the
//!    [`JobQueue`](crate::job_queue::JobQueue); a job that misses the wait
//!    window is answered with an enqueued result carrying its handle
//! 8. Otherwise the handler runs inline, bracketed by listener callbacks
//! 9. Outgoing customizer hooks run in reverse order, unless the result is
//!    direct or enqueued
//! 10. Applicable listeners are attached to the result as a post-processor
//!
//! Log context and uploaded files are cleaned up on every exit path.
//!
//! ## Error Translation
//!
//! - Structured errors propagate; exception-handling customizers are notified
//! - An `SSL` error becomes `UNTRUSTED_CERT_USER_CONFIG` when the
//!   [`TrustConfiguration`](crate::session::TrustConfiguration) lets the user
//!   define trust levels
//! - A TLS failure in the cause chain surfaces as the structured error at the
//!   root of the chain
//! - Everything else, panics included, becomes `UNEXPECTED_ERROR` and the
//!   sanitized query string is written to the log context
//!
//! Each call is recorded once in [`RequestMetrics`](crate::metrics::RequestMetrics)
//! with status `OK` or the error category.
//!
//! ## Example
//!
//! ```rust
//! use ajaxdispatch::dispatcher::Dispatcher;
//! use ajaxdispatch::error::{ActionError, DispatchError};
//! use ajaxdispatch::handler::{ActionFactory, ActionHandler, ActionOutcome};
//! use ajaxdispatch::request::AjaxRequest;
//! use ajaxdispatch::result::AjaxResult;
//! use ajaxdispatch::session::Session;
//! use std::sync::Arc;
//!
//! struct Ping;
//!
//! impl ActionHandler for Ping {
//!     fn perform(&self, _: &mut AjaxRequest, _: &Session) -> Result<ActionOutcome, ActionError> {
//!         Ok(AjaxResult::new(serde_json::json!("pong")).into())
//!     }
//! }
//!
//! struct System;
//!
//! impl ActionFactory for System {
//!     fn create_action(&self, action: &str) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError> {
//!         Ok((action == "ping").then(|| Arc::new(Ping) as Arc<dyn ActionHandler>))
//!     }
//! }
//!
//! let dispatcher = Dispatcher::default();
//! dispatcher.register("system", Arc::new(System));
//!
//! let session = Session::new("abc", 3, 1);
//! let result = dispatcher
//!     .perform(AjaxRequest::new("system", "ping"), Some(&session))
//!     .unwrap();
//! assert_eq!(result.payload(), &serde_json::json!("pong"));
//! ```

mod conditional;
mod core;
mod invocation;

pub use self::core::Dispatcher;
