//! # Error Module
//!
//! Structured errors produced by the dispatch pipeline.
//!
//! A [`DispatchError`] is the only error type that leaves
//! [`Dispatcher::perform`](crate::dispatcher::Dispatcher::perform). It carries an
//! [`ErrorCode`] (a prefix plus a number, e.g. `AJAX-0001`), the display
//! arguments used to render its message, and an optional source error.
//!
//! Handlers report failures through [`ActionError`], which separates three
//! situations the dispatcher translates differently:
//!
//! - [`ActionError::Dispatch`] - a deliberate structured error, propagated as is
//! - [`ActionError::IllegalState`] - unwrapped to its structured cause when it has one
//! - [`ActionError::Unexpected`] - anything else, wrapped into `UNEXPECTED_ERROR`
//!   unless a TLS failure in its chain calls for a different classification
//!
//! [`TlsError`] marks TLS failures inside an error chain.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Shared, thread-safe error source
pub type ErrorSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Error category, used both for client-facing classification and as the
/// status label recorded in request metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Invalid or missing input supplied by the caller
    UserInput,
    /// Conflicting concurrent operation
    Conflict,
    /// Internal failure
    Error,
    /// Upstream system could not be reached or refused the connection
    Connectivity,
    /// Temporary condition, the caller may retry
    TryAgain,
    /// Non-fatal condition the user should be told about
    Warning,
}

impl Category {
    /// Label used for logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::UserInput => "USER_INPUT",
            Category::Conflict => "CONFLICT",
            Category::Error => "ERROR",
            Category::Connectivity => "CONNECTIVITY",
            Category::TryAgain => "TRY_AGAIN",
            Category::Warning => "WARNING",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every error condition the pipeline can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A mandatory request parameter (e.g. the session) is missing
    MissingParameter,
    /// No factory is registered for the module or any of its prefixes
    UnknownModule,
    /// The module's factory does not know the action
    UnknownActionInModule,
    /// A handler produced no result
    UnexpectedResult,
    /// An unchecked failure was wrapped
    UnexpectedError,
    /// The request body looked like JSON but could not be parsed
    InvalidJsonRequestBody,
    /// Customizers kept deferring beyond the configured number of passes
    CustomizerRetryExhausted,
    /// The caller cancelled while waiting for an enqueued job
    Interrupted,
    /// A job with the same deduplication key is already running
    AlreadyRunning,
    /// The remote end presented a certificate that is not trusted
    UntrustedCertificate,
    /// Untrusted certificate, and the user may configure trust themselves
    UntrustedCertUserConfig,
    /// The handler scheduled a continuation
    ScheduledForContinuation,
}

impl ErrorCode {
    /// Code prefix, grouping codes by the subsystem that raises them
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyRunning => "JOB",
            ErrorCode::UntrustedCertificate | ErrorCode::UntrustedCertUserConfig => "SSL",
            ErrorCode::ScheduledForContinuation => "CONTINUATION",
            _ => "AJAX",
        }
    }

    /// Code number within its prefix
    #[must_use]
    pub fn number(&self) -> u16 {
        match self {
            ErrorCode::MissingParameter => 1,
            ErrorCode::UnknownModule => 2,
            ErrorCode::UnknownActionInModule => 3,
            ErrorCode::UnexpectedResult => 4,
            ErrorCode::UnexpectedError => 5,
            ErrorCode::InvalidJsonRequestBody => 6,
            ErrorCode::CustomizerRetryExhausted => 7,
            ErrorCode::Interrupted => 8,
            ErrorCode::AlreadyRunning => 2,
            ErrorCode::UntrustedCertificate => 1,
            ErrorCode::UntrustedCertUserConfig => 2,
            ErrorCode::ScheduledForContinuation => 3,
        }
    }

    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            ErrorCode::MissingParameter
            | ErrorCode::UnknownModule
            | ErrorCode::UnknownActionInModule
            | ErrorCode::InvalidJsonRequestBody => Category::UserInput,
            ErrorCode::AlreadyRunning => Category::Conflict,
            ErrorCode::UntrustedCertificate => Category::Connectivity,
            ErrorCode::UntrustedCertUserConfig => Category::Warning,
            ErrorCode::Interrupted | ErrorCode::ScheduledForContinuation => Category::TryAgain,
            ErrorCode::UnexpectedResult
            | ErrorCode::UnexpectedError
            | ErrorCode::CustomizerRetryExhausted => Category::Error,
        }
    }

    /// Message template; `{n}` is replaced by the n-th display argument
    fn template(&self) -> &'static str {
        match self {
            ErrorCode::MissingParameter => "Missing the following request parameter: {0}",
            ErrorCode::UnknownModule => "Unknown module: {0}",
            ErrorCode::UnknownActionInModule => "Unknown action \"{0}\" in module \"{1}\"",
            ErrorCode::UnexpectedResult => "Unexpected result. Expected \"{0}\", but is \"{1}\"",
            ErrorCode::UnexpectedError => "Unexpected error: {0}",
            ErrorCode::InvalidJsonRequestBody => "Invalid JSON request body: {0}",
            ErrorCode::CustomizerRetryExhausted => {
                "Customizers still deferred after {0} passes: {1}"
            }
            ErrorCode::Interrupted => "Interrupted while waiting for job {0}",
            ErrorCode::AlreadyRunning => {
                "A job of that kind is already running: {0} (user {1}, context {2})"
            }
            ErrorCode::UntrustedCertificate => "The certificate for {0} is not trusted",
            ErrorCode::UntrustedCertUserConfig => {
                "The certificate for {0} is not trusted. You may trust it in your settings"
            }
            ErrorCode::ScheduledForContinuation => "Scheduled for continuation: {0}",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}", self.prefix(), self.number())
    }
}

/// Structured error raised by the dispatch pipeline or by handlers
#[derive(Debug, Clone)]
pub struct DispatchError {
    code: ErrorCode,
    args: Vec<String>,
    source: Option<ErrorSource>,
}

impl DispatchError {
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            args: Vec::new(),
            source: None,
        }
    }

    /// Append a display argument
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace all display arguments
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Attach the error that caused this one
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.source = Some(Arc::from(source.into()));
        self
    }

    #[must_use]
    pub fn with_shared_source(mut self, source: ErrorSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self::new(ErrorCode::MissingParameter).with_arg(name)
    }

    pub fn unknown_module(module: &str) -> Self {
        Self::new(ErrorCode::UnknownModule).with_arg(module)
    }

    pub fn unknown_action(action: &str, module: &str) -> Self {
        Self::new(ErrorCode::UnknownActionInModule)
            .with_arg(action)
            .with_arg(module)
    }

    pub fn unexpected_result(expected: &str, actual: &str) -> Self {
        Self::new(ErrorCode::UnexpectedResult)
            .with_arg(expected)
            .with_arg(actual)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnexpectedError).with_arg(message)
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.code.category()
    }

    #[must_use]
    pub fn prefix(&self) -> &'static str {
        self.code.prefix()
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Source error, if any
    #[must_use]
    pub fn cause(&self) -> Option<&ErrorSource> {
        self.source.as_ref()
    }

    /// Render the message template with the display arguments
    #[must_use]
    pub fn message(&self) -> String {
        let mut message = self.code.template().to_string();
        for (idx, arg) in self.args.iter().enumerate() {
            message = message.replace(&format!("{{{idx}}}"), arg);
        }
        message
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Categories={} Message='{}'",
            self.code,
            self.category(),
            self.message()
        )
    }
}

impl StdError for DispatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Marker for TLS failures (handshake, certificate validation) inside an
/// error chain.
#[derive(Debug, Clone)]
pub struct TlsError {
    message: String,
    source: Option<ErrorSource>,
}

impl TlsError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Chain the underlying cause, e.g. the structured error a TLS client
    /// layer produced for the failing host.
    #[must_use]
    pub fn caused_by<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.source = Some(Arc::from(source.into()));
        self
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS failure: {}", self.message)
    }
}

impl StdError for TlsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Failure reported by an action handler
#[derive(Debug)]
pub enum ActionError {
    /// Deliberate structured error
    Dispatch(DispatchError),
    /// Internal invariant violated; `cause` carries the structured error
    /// that led to it, if any
    IllegalState {
        message: String,
        cause: Option<DispatchError>,
    },
    /// Any other failure
    Unexpected(anyhow::Error),
}

impl ActionError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        ActionError::IllegalState {
            message: message.into(),
            cause: None,
        }
    }
}

impl From<DispatchError> for ActionError {
    fn from(e: DispatchError) -> Self {
        ActionError::Dispatch(e)
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(e: anyhow::Error) -> Self {
        ActionError::Unexpected(e)
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::Dispatch(e) => write!(f, "{e}"),
            ActionError::IllegalState { message, .. } => write!(f, "illegal state: {message}"),
            ActionError::Unexpected(e) => write!(f, "{e}"),
        }
    }
}

impl StdError for ActionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ActionError::Dispatch(e) => e.source(),
            ActionError::IllegalState { cause, .. } => {
                cause.as_ref().map(|e| e as &(dyn StdError + 'static))
            }
            ActionError::Unexpected(e) => {
                let inner: &(dyn StdError + 'static) = e.as_ref();
                Some(inner)
            }
        }
    }
}

/// Walk an error chain, starting with `err` itself
pub(crate) fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn StdError + 'static)| (*e).source())
}

/// Whether a TLS failure appears anywhere in the chain
pub(crate) fn has_tls_cause(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| e.is::<TlsError>())
}

/// The structured error closest to the root of the chain
pub(crate) fn root_dispatch_error(err: &(dyn StdError + 'static)) -> Option<DispatchError> {
    chain(err)
        .filter_map(|e| e.downcast_ref::<DispatchError>())
        .last()
        .cloned()
}
