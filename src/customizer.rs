//! # Customizer Module
//!
//! Request/response interceptors around the handler call.
//!
//! Customizers are created per request by registered [`CustomizerFactory`]
//! instances. Each has two hooks:
//!
//! - `incoming` runs before the action is resolved and may rewrite the request
//! - `outgoing` runs after the handler and may rewrite the result
//!
//! Either hook may answer [`Step::Later`] to be retried once the others have
//! run. [`CustomizerChain`] repeats passes over the deferring members until
//! each has succeeded once, failing with `CUSTOMIZER_RETRY_EXHAUSTED` after
//! the configured number of passes.
//!
//! ## Ordering
//!
//! Incoming hooks run in registration order; deferred members keep their
//! relative order on the next pass. Outgoing hooks run in reverse of the
//! order in which the incoming hooks succeeded (reverse registration order
//! when nothing deferred) and stop as soon as a result is [`ResultKind::Direct`].

use crate::error::{DispatchError, ErrorCode};
use crate::request::AjaxRequest;
use crate::result::{AjaxResult, ResultKind};
use crate::session::Session;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a customizer hook wants to happen next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Proceed,
    /// Retry this customizer after the others; the reason is reported if
    /// retries run out
    Later(String),
}

/// Per-request interceptor
pub trait Customizer: Send + Sync {
    fn incoming(&self, _request: &mut AjaxRequest, _session: &Session) -> Result<Step, DispatchError> {
        Ok(Step::Proceed)
    }

    fn outgoing(
        &self,
        _request: &AjaxRequest,
        _result: &mut AjaxResult,
        _session: &Session,
    ) -> Result<Step, DispatchError> {
        Ok(Step::Proceed)
    }

    fn as_exception_handler(&self) -> Option<&dyn ExceptionHandler> {
        None
    }

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Notified when the handler call fails
pub trait ExceptionHandler: Send + Sync {
    fn exception_occurred(&self, request: &AjaxRequest, session: &Session, error: &DispatchError);
}

/// Creates customizers per request; may decline
pub trait CustomizerFactory: Send + Sync {
    fn create_customizer(
        &self,
        request: &AjaxRequest,
        session: &Session,
    ) -> Option<Arc<dyn Customizer>>;
}

/// The customizers of one request
#[derive(Clone)]
pub struct CustomizerChain {
    members: Vec<Arc<dyn Customizer>>,
    max_passes: usize,
}

impl CustomizerChain {
    #[must_use]
    pub fn new(members: Vec<Arc<dyn Customizer>>, max_passes: usize) -> Self {
        Self {
            members,
            max_passes: max_passes.max(1),
        }
    }

    /// Ask every factory for a customizer, in registration order
    pub fn from_factories(
        factories: &[Arc<dyn CustomizerFactory>],
        request: &AjaxRequest,
        session: &Session,
        max_passes: usize,
    ) -> Self {
        let members = factories
            .iter()
            .filter_map(|f| f.create_customizer(request, session))
            .collect();
        Self::new(members, max_passes)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Run the incoming hooks.
    ///
    /// Afterwards the chain holds its members in the order their incoming
    /// hooks succeeded, which is the basis for the outgoing order.
    pub fn apply_incoming(
        &mut self,
        request: &mut AjaxRequest,
        session: &Session,
    ) -> Result<(), DispatchError> {
        let mut pending: Vec<Arc<dyn Customizer>> = std::mem::take(&mut self.members);
        let mut succeeded = Vec::with_capacity(pending.len());

        let outcome = run_passes(&mut pending, self.max_passes, "incoming", |customizer| {
            let step = customizer.incoming(request, session)?;
            if step == Step::Proceed {
                succeeded.push(Arc::clone(customizer));
            }
            Ok(step.into())
        });

        // Members that never got to run keep their place behind the ones that did
        succeeded.append(&mut pending);
        self.members = succeeded;
        outcome
    }

    /// Run the outgoing hooks in reverse order, stopping on a direct result
    pub fn apply_outgoing(
        &self,
        request: &AjaxRequest,
        result: &mut AjaxResult,
        session: &Session,
    ) -> Result<(), DispatchError> {
        if result.kind() == ResultKind::Direct {
            return Ok(());
        }
        let mut pending: Vec<Arc<dyn Customizer>> = self.members.iter().rev().cloned().collect();
        run_passes(&mut pending, self.max_passes, "outgoing", |customizer| {
            let step = customizer.outgoing(request, result, session)?;
            if step == Step::Proceed && result.kind() == ResultKind::Direct {
                return Ok(Flow::Stop);
            }
            Ok(step.into())
        })
    }

    /// Notify exception-handling customizers. Their failures are swallowed.
    pub fn notify_exception(&self, request: &AjaxRequest, session: &Session, error: &DispatchError) {
        for customizer in &self.members {
            let Some(handler) = customizer.as_exception_handler() else {
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.exception_occurred(request, session, error);
            }));
            if outcome.is_err() {
                warn!(
                    customizer = %customizer.name(),
                    error_code = %error.code(),
                    "Exception handler panicked; ignored"
                );
            }
        }
    }
}

/// Per-member decision inside one pass
enum Flow {
    Done,
    Retry(String),
    Stop,
}

impl From<Step> for Flow {
    fn from(step: Step) -> Self {
        match step {
            Step::Proceed => Flow::Done,
            Step::Later(reason) => Flow::Retry(reason),
        }
    }
}

/// Apply `hook` to `pending` until every member is done, a member stops the
/// run, or `max_passes` is exceeded. Finished members are removed from
/// `pending`; on error the unfinished ones are left in place.
fn run_passes<F>(
    pending: &mut Vec<Arc<dyn Customizer>>,
    max_passes: usize,
    direction: &'static str,
    mut hook: F,
) -> Result<(), DispatchError>
where
    F: FnMut(&Arc<dyn Customizer>) -> Result<Flow, DispatchError>,
{
    let mut pass = 0usize;
    let mut reasons: Vec<String> = Vec::new();
    while !pending.is_empty() {
        if pass == max_passes {
            warn!(
                direction = direction,
                passes = max_passes,
                deferred = pending.len(),
                "Customizers still deferring; giving up"
            );
            return Err(DispatchError::new(ErrorCode::CustomizerRetryExhausted)
                .with_arg(max_passes.to_string())
                .with_arg(reasons.join(", ")));
        }
        if pass > 0 {
            std::thread::yield_now();
        }
        pass += 1;
        reasons.clear();

        let mut deferred = Vec::new();
        let mut queue = std::mem::take(pending).into_iter();
        while let Some(customizer) = queue.next() {
            match hook(&customizer) {
                Ok(Flow::Done) => {}
                Ok(Flow::Retry(reason)) => {
                    debug!(
                        customizer = %customizer.name(),
                        direction = direction,
                        pass = pass,
                        reason = %reason,
                        "Customizer deferred"
                    );
                    reasons.push(format!("{}: {reason}", customizer.name()));
                    deferred.push(customizer);
                }
                Ok(Flow::Stop) => {
                    debug!(
                        customizer = %customizer.name(),
                        direction = direction,
                        "Direct result; remaining customizers skipped"
                    );
                    return Ok(());
                }
                Err(e) => {
                    deferred.push(customizer);
                    deferred.extend(queue);
                    *pending = deferred;
                    return Err(e);
                }
            }
        }
        *pending = deferred;
    }
    Ok(())
}
