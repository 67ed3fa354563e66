//! # Result Module
//!
//! [`AjaxResult`] is the uniform response envelope produced by exactly one
//! handler invocation (or one caching short-circuit) and consumed once by the
//! caller, who maps it to the wire.

use crate::error::DispatchError;
use http::StatusCode;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Format of results whose payload is plain JSON
pub const FORMAT_JSON: &str = "json";

/// Format of results that carry an enqueued job handle
pub const FORMAT_ENQUEUED: &str = "enqueued";

/// How the caller should treat a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Regular payload, rendered by the caller
    Normal,
    /// The handler already wrote the response itself; no further processing
    Direct,
    /// The work runs in the job queue; the payload is the job handle
    Enqueued,
    /// The client's cached copy is still valid (maps to `304 Not Modified`)
    ETag,
}

/// Token under which partially completed work can be resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationToken(pub ulid::Ulid);

impl ContinuationToken {
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for ContinuationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hook run once the caller finished writing a result
pub trait PostProcessor: Send + Sync {
    fn done(&self, result: &AjaxResult, error: Option<&DispatchError>);
}

/// Response envelope
#[derive(Clone)]
pub struct AjaxResult {
    kind: ResultKind,
    payload: Value,
    format: String,
    timestamp: Option<i64>,
    status: Option<StatusCode>,
    expires: Option<i64>,
    continuation: Option<ContinuationToken>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
}

impl AjaxResult {
    /// A normal JSON result
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            kind: ResultKind::Normal,
            payload,
            format: FORMAT_JSON.to_string(),
            timestamp: None,
            status: None,
            expires: None,
            continuation: None,
            post_processors: Vec::new(),
        }
    }

    /// The handler wrote the response itself
    #[must_use]
    pub fn direct() -> Self {
        Self::new(Value::Null).with_kind(ResultKind::Direct)
    }

    /// Cache hit; `expires` is forwarded when positive
    #[must_use]
    pub fn not_modified(expires: Option<i64>) -> Self {
        let mut result = Self::new(Value::Null).with_kind(ResultKind::ETag);
        result.expires = expires.filter(|e| *e > 0);
        result
    }

    /// A failed `If-Match` / `If-Unmodified-Since` precondition
    #[must_use]
    pub fn precondition_failed() -> Self {
        Self::new(Value::Null).with_status(StatusCode::PRECONDITION_FAILED)
    }

    /// Handle of a job that did not complete within the wait window
    #[must_use]
    pub fn enqueued(job_info: Value) -> Self {
        Self::new(job_info)
            .with_kind(ResultKind::Enqueued)
            .with_format(FORMAT_ENQUEUED)
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ResultKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Last-modified timestamp of the data, epoch millis
    #[must_use]
    pub fn with_timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_expires(mut self, millis: i64) -> Self {
        self.expires = Some(millis);
        self
    }

    #[must_use]
    pub fn with_continuation(mut self, token: ContinuationToken) -> Self {
        self.continuation = Some(token);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: ResultKind) {
        self.kind = kind;
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.payload = payload;
    }

    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// HTTP status override, if the result demands one
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    #[must_use]
    pub fn expires(&self) -> Option<i64> {
        self.expires
    }

    #[must_use]
    pub fn continuation(&self) -> Option<ContinuationToken> {
        self.continuation
    }

    pub fn add_post_processor(&mut self, processor: Arc<dyn PostProcessor>) {
        self.post_processors.push(processor);
    }

    #[must_use]
    pub fn post_processor_count(&self) -> usize {
        self.post_processors.len()
    }

    /// Signal that the result was written (or writing failed with `error`)
    pub fn signal_done(&self, error: Option<&DispatchError>) {
        for processor in &self.post_processors {
            processor.done(self, error);
        }
    }
}

impl fmt::Debug for AjaxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AjaxResult")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("status", &self.status)
            .field("timestamp", &self.timestamp)
            .field("expires", &self.expires)
            .field("continuation", &self.continuation)
            .field("post_processors", &self.post_processors.len())
            .field("payload", &self.payload)
            .finish()
    }
}
