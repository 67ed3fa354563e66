//! The handler call proper: state initialization, listener callbacks,
//! outgoing customization and post-processor attachment.
//!
//! An [`Invocation`] holds everything the call needs besides the request,
//! the session and the customizer chain, so the same code runs inline on the
//! caller's thread and inside a job on a queue worker.

use crate::customizer::CustomizerChain;
use crate::error::{has_tls_cause, root_dispatch_error, ActionError, DispatchError};
use crate::handler::{ActionFactory, ActionHandler, ActionOutcome, Continuation};
use crate::listener::{DispatcherListener, ListenerPostProcessor, ListenerRegistry};
use crate::log_context::{self, QUERY_STRING};
use crate::otel::Redactor;
use crate::request::AjaxRequest;
use crate::result::{AjaxResult, ResultKind};
use crate::session::Session;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Why a dispatch did not produce a result
#[derive(Debug)]
pub(crate) enum Failure {
    /// Structured error, propagated after translation
    Dispatch(DispatchError),
    /// Anything else; wrapped into `UNEXPECTED_ERROR`
    Unchecked(anyhow::Error),
}

impl From<DispatchError> for Failure {
    fn from(e: DispatchError) -> Self {
        Failure::Dispatch(e)
    }
}

impl From<ActionError> for Failure {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::Dispatch(e) => Failure::Dispatch(e),
            ActionError::IllegalState {
                cause: Some(cause), ..
            } => Failure::Dispatch(cause),
            ActionError::IllegalState {
                message,
                cause: None,
            } => Failure::Dispatch(DispatchError::unexpected(message)),
            ActionError::Unexpected(e) => {
                // A TLS failure carrying a structured error surfaces as that error
                let source: &(dyn std::error::Error + 'static) = e.as_ref();
                let root = has_tls_cause(source)
                    .then(|| root_dispatch_error(source))
                    .flatten();
                match root {
                    Some(root) => Failure::Dispatch(root),
                    None => Failure::Unchecked(e),
                }
            }
        }
    }
}

impl Failure {
    /// The structured error this failure is reported as
    pub(crate) fn into_dispatch_error(self) -> DispatchError {
        match self {
            Failure::Dispatch(e) => e,
            Failure::Unchecked(e) => DispatchError::unexpected(e.to_string()).with_source(e),
        }
    }

    /// Structured view for listeners, without consuming the failure
    fn preview(&self) -> DispatchError {
        match self {
            Failure::Dispatch(e) => e.clone(),
            Failure::Unchecked(e) => DispatchError::unexpected(e.to_string()),
        }
    }
}

/// Readable message of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A resolved action, ready to be called
#[derive(Clone)]
pub(crate) struct Invocation {
    pub(crate) handler: Arc<dyn ActionHandler>,
    pub(crate) factory: Arc<dyn ActionFactory>,
    /// Module the factory is registered under
    pub(crate) module: String,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) default_format: Arc<str>,
    pub(crate) redactor: Redactor,
}

impl Invocation {
    pub(crate) fn run(
        &self,
        request: &mut AjaxRequest,
        session: &Session,
        chain: &CustomizerChain,
    ) -> Result<AjaxResult, Failure> {
        if request.state_mut().add_initializer(&self.module) {
            self.factory.initialize_state(request.state_mut());
        }
        if request.format().is_none() {
            request.set_format(self.default_format.as_ref());
        }

        let listeners = self.listeners.applicable(request);
        let mut result = self.call_action(request, session, &listeners)?;
        if !matches!(result.kind(), ResultKind::Direct | ResultKind::Enqueued) {
            chain.apply_outgoing(request, &mut result, session)?;
        }
        if !listeners.is_empty() {
            result.add_post_processor(Arc::new(ListenerPostProcessor::new(listeners)));
        }
        Ok(result)
    }

    /// Body of a queued job: runs with its own log context and reports
    /// failures in their final structured form.
    pub(crate) fn run_detached(
        &self,
        mut request: AjaxRequest,
        session: Session,
        chain: CustomizerChain,
    ) -> Result<AjaxResult, DispatchError> {
        let log = log_context::enter(&request);
        log.set_action(request.module(), request.action());
        let outcome = self
            .run(&mut request, &session, &chain)
            .map_err(Failure::into_dispatch_error);
        request.clean_uploads();
        outcome
    }

    fn call_action(
        &self,
        request: &mut AjaxRequest,
        session: &Session,
        listeners: &[Arc<dyn DispatcherListener>],
    ) -> Result<AjaxResult, Failure> {
        for listener in listeners {
            listener.on_request_initialized(request);
        }
        let outcome = self.call_handler(request, session);
        match &outcome {
            Ok(result) => {
                for listener in listeners {
                    listener.on_request_performed(request, Some(result), None);
                }
            }
            Err(failure) if !listeners.is_empty() => {
                let error = failure.preview();
                for listener in listeners {
                    listener.on_request_performed(request, None, Some(&error));
                }
            }
            Err(_) => {}
        }
        outcome
    }

    fn call_handler(
        &self,
        request: &mut AjaxRequest,
        session: &Session,
    ) -> Result<AjaxResult, Failure> {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.perform(request, session)));
        request.clean_uploads();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(
                    parent: &log_context::current_span(),
                    module = %request.module(),
                    action = %request.action(),
                    panic_message = %message,
                    "Handler panicked"
                );
                return Err(Failure::Unchecked(anyhow::anyhow!(
                    "handler panicked: {message}"
                )));
            }
        };

        match outcome? {
            ActionOutcome::Done(result) => Ok(result),
            ActionOutcome::Continuation(continuation) => Ok(continuation_result(continuation)),
            ActionOutcome::NoResult => {
                log_context::put(
                    QUERY_STRING,
                    log_context::sanitized_query_string(request, &self.redactor),
                );
                error!(
                    parent: &log_context::current_span(),
                    module = %request.module(),
                    action = %request.action(),
                    "Handler produced no result"
                );
                Err(DispatchError::unexpected_result("AjaxResult", "null").into())
            }
        }
    }
}

/// Normal result for a continuation; completed ones carry no token
fn continuation_result(continuation: Continuation) -> AjaxResult {
    let Continuation {
        token,
        value,
        format,
        timestamp,
        completed,
    } = continuation;
    debug!(
        parent: &log_context::current_span(),
        token = %token,
        completed = completed,
        "Handler returned a continuation"
    );

    let mut result = AjaxResult::new(value).with_format(format);
    if let Some(ts) = timestamp {
        result = result.with_timestamp(ts);
    }
    if !completed {
        result = result.with_continuation(token);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, TlsError};
    use crate::result::ContinuationToken;
    use serde_json::json;

    #[test]
    fn test_illegal_state_unwraps_structured_cause() {
        let failure = Failure::from(ActionError::IllegalState {
            message: "broken".into(),
            cause: Some(DispatchError::unknown_module("calendar")),
        });
        match failure {
            Failure::Dispatch(e) => assert_eq!(e.code(), ErrorCode::UnknownModule),
            other => panic!("unexpected {other:?}"),
        }

        let failure = Failure::from(ActionError::illegal_state("broken"));
        let e = failure.into_dispatch_error();
        assert_eq!(e.code(), ErrorCode::UnexpectedError);
        assert_eq!(e.args(), &["broken".to_string()]);
    }

    #[test]
    fn test_tls_wrapped_structured_error_is_unwrapped() {
        let inner = DispatchError::new(ErrorCode::UntrustedCertificate).with_arg("imap.example.com");
        let err = anyhow::Error::new(TlsError::new("handshake").caused_by(inner));
        match Failure::from(ActionError::Unexpected(err)) {
            Failure::Dispatch(e) => assert_eq!(e.code(), ErrorCode::UntrustedCertificate),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unchecked_keeps_message_and_source() {
        let failure = Failure::from(ActionError::Unexpected(anyhow::anyhow!("disk full")));
        let e = failure.into_dispatch_error();
        assert_eq!(e.code(), ErrorCode::UnexpectedError);
        assert_eq!(e.message(), "Unexpected error: disk full");
        assert!(e.cause().is_some());
    }

    #[test]
    fn test_continuation_result() {
        let token = ContinuationToken::new();
        let pending = continuation_result(Continuation {
            token,
            value: json!([1]),
            format: "json".into(),
            timestamp: Some(7),
            completed: false,
        });
        assert_eq!(pending.continuation(), Some(token));
        assert_eq!(pending.timestamp(), Some(7));
        assert_eq!(pending.kind(), ResultKind::Normal);

        let done = continuation_result(Continuation {
            token,
            value: json!([1, 2]),
            format: "json".into(),
            timestamp: None,
            completed: true,
        });
        assert_eq!(done.continuation(), None);
        assert_eq!(done.payload(), &json!([1, 2]));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
    }
}
