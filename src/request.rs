//! # Request Module
//!
//! [`AjaxRequest`] is the data a single in-flight call owns: routing key
//! (module and action), parameters, headers, the lazily loaded body, HTTP
//! conditional fields, the response format hint and a mutable state bag.
//!
//! A request is never shared between threads. When a call is offloaded to the
//! job queue the request moves into the job.

use crate::ids::RequestId;
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Maximum inline headers before heap allocation
/// Most requests have ≤16 headers
pub const MAX_INLINE_HEADERS: usize = 16;

/// Stack-allocated header storage for the hot path
///
/// Header names use `Arc<str>` because names repeat across requests
/// (`If-None-Match`, `Content-Type`, ...) and cloning them is O(1).
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Name reported when a request arrives without a session
pub const PARAMETER_SESSION: &str = "session";

/// Request parameter that opts a call into job-queue offloading
pub const PARAMETER_ALLOW_ENQUEUE: &str = "allow_enqueue";

/// Request parameter carrying a URL-encoded body when the body itself is empty
pub const PARAMETER_DATA: &str = "data";

/// Parsed request body
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// JSON object or array
    Json(Value),
    /// Anything that is not JSON
    Text(String),
    /// Nothing was sent
    Empty,
}

/// Per-request state bag.
///
/// Besides free-form properties it remembers which modules already
/// initialized it, so a factory's state initialization runs once per module.
#[derive(Debug, Default, Clone)]
pub struct AjaxState {
    properties: HashMap<String, Value>,
    initialized_modules: HashSet<String>,
}

impl AjaxState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `module` initialized this state. Returns `true` the first time.
    pub fn add_initializer(&mut self, module: &str) -> bool {
        self.initialized_modules.insert(module.to_string())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn put(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.properties.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }
}

/// Cooperative cancellation flag for a request.
///
/// Cloned handles share the flag; the transport layer cancels when the client
/// goes away and blocking waits inside the pipeline observe it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Obsolete HTTP-date layouts: RFC 850 and asctime, both implicitly GMT
const OBSOLETE_HTTP_DATE_FORMATS: [&str; 2] = ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"];

/// Parse an HTTP-date into epoch millis.
///
/// Accepts the preferred `Sun, 06 Nov 1994 08:49:37 GMT` form as well as
/// `Sunday, 06-Nov-94 08:49:37 GMT` and `Sun Nov  6 08:49:37 1994`.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        return Some(date.timestamp_millis());
    }
    OBSOLETE_HTTP_DATE_FORMATS.iter().find_map(|format| {
        chrono::NaiveDateTime::parse_from_str(value, format)
            .ok()
            .map(|d| d.and_utc().timestamp_millis())
    })
}

/// Interpret a request parameter as a boolean flag
fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// A request on its way through the dispatcher
#[derive(Debug, Default)]
pub struct AjaxRequest {
    /// Unique request ID for tracing and correlation
    pub request_id: RequestId,
    module: String,
    action: String,
    parameters: HashMap<String, String>,
    headers: HeaderVec,
    raw_body: Option<Vec<u8>>,
    body: Option<RequestBody>,
    etag: Option<String>,
    last_modified: Option<i64>,
    expires: Option<i64>,
    format: Option<String>,
    state: AjaxState,
    uploads: Vec<PathBuf>,
    cancellation: CancellationToken,
}

impl AjaxRequest {
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value.into());
        self
    }

    /// Body bytes as delivered by the transport, parsed on demand
    #[must_use]
    pub fn with_raw_body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.raw_body = Some(bytes.into());
        self
    }

    /// ETag the client holds (`If-None-Match`)
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Timestamp of the client's copy (`If-Modified-Since`), epoch millis
    #[must_use]
    pub fn with_last_modified(mut self, millis: i64) -> Self {
        self.last_modified = Some(millis);
        self
    }

    /// Expiry hint forwarded to not-modified results, epoch millis
    #[must_use]
    pub fn with_expires(mut self, millis: i64) -> Self {
        self.expires = Some(millis);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Register an uploaded temporary file that is deleted once the call ends
    #[must_use]
    pub fn with_upload(mut self, path: impl Into<PathBuf>) -> Self {
        self.uploads.push(path.into());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn set_module(&mut self, module: impl Into<String>) {
        self.module = module.into();
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn set_action(&mut self, action: impl Into<String>) {
        self.action = action.into();
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn put_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Boolean view of a parameter; absent means `false`
    #[must_use]
    pub fn bool_parameter(&self, name: &str) -> bool {
        self.parameter(name).is_some_and(parse_bool)
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Add or update a header
    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((Arc::from(name), value));
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderVec {
        &self.headers
    }

    /// Client ETag: explicit value, else the `If-None-Match` header
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref().or_else(|| self.header("If-None-Match"))
    }

    /// Client timestamp: explicit value, else the parsed `If-Modified-Since` header
    #[must_use]
    pub fn last_modified(&self) -> Option<i64> {
        self.last_modified
            .or_else(|| self.header("If-Modified-Since").and_then(parse_http_date))
    }

    #[must_use]
    pub fn if_match(&self) -> Option<&str> {
        self.header("If-Match")
    }

    #[must_use]
    pub fn if_unmodified_since(&self) -> Option<i64> {
        self.header("If-Unmodified-Since").and_then(parse_http_date)
    }

    #[must_use]
    pub fn expires(&self) -> Option<i64> {
        self.expires
    }

    #[must_use]
    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn set_format(&mut self, format: impl Into<String>) {
        self.format = Some(format.into());
    }

    /// Parsed body, `None` until a body reader loaded it
    #[must_use]
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: RequestBody) {
        self.body = Some(body);
    }

    #[must_use]
    pub fn is_body_loaded(&self) -> bool {
        self.body.is_some()
    }

    /// Take the unparsed body bytes, leaving nothing behind
    pub fn take_raw_body(&mut self) -> Option<Vec<u8>> {
        self.raw_body.take()
    }

    #[must_use]
    pub fn state(&self) -> &AjaxState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AjaxState {
        &mut self.state
    }

    #[must_use]
    pub fn uploads(&self) -> &[PathBuf] {
        &self.uploads
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Move the request out for a job, leaving behind a copy of its routing
    /// data (id, module, action, parameters, headers, format) for logging
    /// and exception handlers. Body, state and uploads travel with the job.
    pub(crate) fn take_for_job(&mut self) -> AjaxRequest {
        let shadow = AjaxRequest {
            request_id: self.request_id,
            module: self.module.clone(),
            action: self.action.clone(),
            parameters: self.parameters.clone(),
            headers: self.headers.clone(),
            format: self.format.clone(),
            cancellation: self.cancellation.clone(),
            ..AjaxRequest::default()
        };
        std::mem::replace(self, shadow)
    }

    /// Delete uploaded temporary files. Idempotent.
    pub fn clean_uploads(&mut self) {
        for path in self.uploads.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(
                    path = %path.display(),
                    error = %e,
                    "Failed to delete uploaded file"
                ),
            }
        }
    }
}
