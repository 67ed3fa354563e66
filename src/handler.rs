//! # Handler Module
//!
//! Contracts between the dispatcher and pluggable business actions.
//!
//! An [`ActionFactory`] is registered per module and creates the
//! [`ActionHandler`] for an action name. Handlers are stateless and reentrant;
//! one handler instance may serve many concurrent calls.
//!
//! ## Capabilities
//!
//! Optional behaviour is declared explicitly instead of being discovered at
//! runtime:
//!
//! - [`ActionNotes`] - static flags (stream preference, enqueueability, session
//!   requirements), cached per module/action by the dispatcher
//! - [`ETagAware`] - validates client ETags for `If-None-Match` / `If-Match`
//! - [`LastModifiedAware`] - validates client timestamps for
//!   `If-Modified-Since` / `If-Unmodified-Since`
//! - [`Enqueueable`] - decides per request whether the call may be offloaded to
//!   the job queue, and under which deduplication key

use crate::error::{ActionError, DispatchError};
use crate::request::{AjaxRequest, AjaxState};
use crate::result::{AjaxResult, ContinuationToken};
use crate::session::Session;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Static capability flags of an action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionNotes {
    /// The handler reads the body stream itself; do not load it eagerly
    pub prefer_stream: bool,
    /// Calls may be offloaded to the job queue
    pub enqueueable: bool,
    /// A fallback (public) session may be used
    pub allow_public_session: bool,
    /// Public session authentication may be performed
    pub public_session_auth: bool,
    /// The action may be called without any session
    pub no_session: bool,
    /// The secret cookie check is skipped
    pub no_secret_callback: bool,
}

impl ActionNotes {
    #[must_use]
    pub fn prefer_stream(mut self) -> Self {
        self.prefer_stream = true;
        self
    }

    #[must_use]
    pub fn enqueueable(mut self) -> Self {
        self.enqueueable = true;
        self
    }

    #[must_use]
    pub fn allow_public_session(mut self) -> Self {
        self.allow_public_session = true;
        self
    }

    #[must_use]
    pub fn public_session_auth(mut self) -> Self {
        self.public_session_auth = true;
        self
    }

    #[must_use]
    pub fn no_session(mut self) -> Self {
        self.no_session = true;
        self
    }

    #[must_use]
    pub fn no_secret_callback(mut self) -> Self {
        self.no_secret_callback = true;
        self
    }
}

/// Key under which concurrent identical jobs are deduplicated
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub user_id: i32,
    pub context_id: i32,
    pub identifier: String,
}

impl JobKey {
    pub fn new(session: &Session, identifier: impl Into<String>) -> Self {
        Self {
            user_id: session.user_id(),
            context_id: session.context_id(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user_id, self.context_id, self.identifier)
    }
}

/// Outcome of an enqueueability check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueDecision {
    enqueueable: bool,
    key: Option<JobKey>,
}

impl EnqueueDecision {
    /// Run inline
    #[must_use]
    pub fn inline() -> Self {
        Self::default()
    }

    /// Offload; without a key every submission is unique
    #[must_use]
    pub fn enqueue(key: Option<JobKey>) -> Self {
        Self {
            enqueueable: true,
            key,
        }
    }

    #[must_use]
    pub fn is_enqueueable(&self) -> bool {
        self.enqueueable
    }

    #[must_use]
    pub fn key(&self) -> Option<&JobKey> {
        self.key.as_ref()
    }

    pub(crate) fn into_key(self) -> Option<JobKey> {
        self.key
    }
}

/// Partially completed work, resumable under `token`
#[derive(Debug, Clone)]
pub struct Continuation {
    pub token: ContinuationToken,
    /// Payload available so far
    pub value: Value,
    pub format: String,
    pub timestamp: Option<i64>,
    /// Whether the work already finished; completed continuations carry no token
    pub completed: bool,
}

/// What a handler produced
#[derive(Debug)]
pub enum ActionOutcome {
    Done(AjaxResult),
    Continuation(Continuation),
    /// The handler produced nothing. This is a bug in the handler and
    /// surfaces as `UNEXPECTED_RESULT`.
    NoResult,
}

impl From<AjaxResult> for ActionOutcome {
    fn from(result: AjaxResult) -> Self {
        ActionOutcome::Done(result)
    }
}

/// ETag validation
pub trait ETagAware: Send + Sync {
    /// Whether `etag` denotes the current state of the requested data
    fn check_etag(
        &self,
        etag: &str,
        request: &AjaxRequest,
        session: &Session,
    ) -> Result<bool, DispatchError>;
}

/// Timestamp validation
pub trait LastModifiedAware: Send + Sync {
    /// Whether the requested data was not modified after `timestamp`
    /// (epoch millis, already including clock skew)
    fn check_last_modified(
        &self,
        timestamp: i64,
        request: &AjaxRequest,
        session: &Session,
    ) -> Result<bool, DispatchError>;
}

/// Per-request job-queue offloading
pub trait Enqueueable: Send + Sync {
    fn is_enqueueable(
        &self,
        request: &AjaxRequest,
        session: &Session,
    ) -> Result<EnqueueDecision, DispatchError>;

    /// Last chance to capture state before the request moves into a job
    fn prepare_for_enqueue(
        &self,
        _request: &mut AjaxRequest,
        _session: &Session,
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// A business action
pub trait ActionHandler: Send + Sync {
    fn perform(
        &self,
        request: &mut AjaxRequest,
        session: &Session,
    ) -> Result<ActionOutcome, ActionError>;

    /// Static capability flags; `None` means no notes were declared
    fn notes(&self) -> Option<ActionNotes> {
        None
    }

    fn as_etag_aware(&self) -> Option<&dyn ETagAware> {
        None
    }

    fn as_last_modified_aware(&self) -> Option<&dyn LastModifiedAware> {
        None
    }

    fn as_enqueueable(&self) -> Option<&dyn Enqueueable> {
        None
    }
}

/// Creates handlers for the actions of one module
pub trait ActionFactory: Send + Sync {
    /// Handler for `action`, or `None` if the action is unknown
    fn create_action(&self, action: &str) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError>;

    /// Whether this factory can share its module with other factories
    fn combinable(&self) -> bool {
        false
    }

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs once per module and request state before the first handler call
    fn initialize_state(&self, _state: &mut AjaxState) {}
}

/// Several factories sharing one module, tried in registration order
#[derive(Clone, Default)]
pub struct CombinedActionFactory {
    members: Vec<Arc<dyn ActionFactory>>,
}

impl CombinedActionFactory {
    pub fn new(members: Vec<Arc<dyn ActionFactory>>) -> Self {
        Self { members }
    }

    /// Copy with `factory` appended
    #[must_use]
    pub fn with(&self, factory: Arc<dyn ActionFactory>) -> Self {
        let mut members = self.members.clone();
        members.push(factory);
        Self { members }
    }

    /// Copy without `factory` (matched by identity)
    #[must_use]
    pub fn without(&self, factory: &Arc<dyn ActionFactory>) -> Self {
        let members = self
            .members
            .iter()
            .filter(|m| !Arc::ptr_eq(m, factory))
            .cloned()
            .collect();
        Self { members }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn members(&self) -> &[Arc<dyn ActionFactory>] {
        &self.members
    }
}

impl ActionFactory for CombinedActionFactory {
    fn create_action(&self, action: &str) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError> {
        for member in &self.members {
            if let Some(handler) = member.create_action(action)? {
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    fn combinable(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "CombinedActionFactory"
    }

    fn initialize_state(&self, state: &mut AjaxState) {
        for member in &self.members {
            member.initialize_state(state);
        }
    }
}

/// Pre-invocation processing for handlers that carry a particular marker,
/// e.g. permission or scope validation.
pub trait AnnotationProcessor: Send + Sync {
    fn handles(&self, handler: &dyn ActionHandler) -> bool;

    fn process(
        &self,
        handler: &dyn ActionHandler,
        request: &mut AjaxRequest,
        session: &Session,
    ) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ActionHandler for Echo {
        fn perform(
            &self,
            request: &mut AjaxRequest,
            _session: &Session,
        ) -> Result<ActionOutcome, ActionError> {
            Ok(AjaxResult::new(Value::String(request.action().to_string())).into())
        }
    }

    struct Knows(&'static str);

    impl ActionFactory for Knows {
        fn create_action(
            &self,
            action: &str,
        ) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError> {
            Ok((action == self.0).then(|| Arc::new(Echo) as Arc<dyn ActionHandler>))
        }
    }

    #[test]
    fn test_combined_tries_members_in_order() {
        let first: Arc<dyn ActionFactory> = Arc::new(Knows("get"));
        let second: Arc<dyn ActionFactory> = Arc::new(Knows("list"));
        let combined = CombinedActionFactory::default()
            .with(Arc::clone(&first))
            .with(Arc::clone(&second));
        assert!(combined.create_action("get").unwrap().is_some());
        assert!(combined.create_action("list").unwrap().is_some());
        assert!(combined.create_action("delete").unwrap().is_none());

        let reduced = combined.without(&first);
        assert_eq!(reduced.len(), 1);
        assert!(reduced.create_action("get").unwrap().is_none());
        assert!(reduced.without(&second).is_empty());
    }

    #[test]
    fn test_notes_builders() {
        let notes = ActionNotes::default().enqueueable().no_session();
        assert!(notes.enqueueable);
        assert!(notes.no_session);
        assert!(!notes.prefer_stream);
    }
}
