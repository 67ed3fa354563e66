//! Request-scoped log context.
//!
//! While a request is dispatched the current coroutine carries a small
//! property map (`ajax.module`, `ajax.action`, `request.id`, and after
//! unexpected failures the sanitized query string) and an `ajax_request` span
//! whose fields mirror the properties. Outside a coroutine the storage falls
//! back to the current thread. [`LogContextGuard`] clears both when dropped,
//! so the context never outlives the call on any exit path.
//!
//! The span is never entered: handlers may yield their coroutine and resume
//! on another worker thread, so dispatcher events name it as their parent
//! explicitly (`parent: &log_context::current_span()`).

use crate::otel::Redactor;
use crate::request::AjaxRequest;
use std::cell::RefCell;
use std::collections::BTreeMap;
use tracing::Span;

pub const MODULE: &str = "ajax.module";
pub const ACTION: &str = "ajax.action";
pub const REQUEST_ID: &str = "request.id";
pub const QUERY_STRING: &str = "ajax.querystring";

/// Parameter never written to the log context; it carries whole JSON documents
const SKIPPED_PARAMETER: &str = "json";

#[derive(Default)]
struct Context {
    properties: BTreeMap<&'static str, String>,
    span: Option<Span>,
}

may::coroutine_local!(static CONTEXT: RefCell<Context> = RefCell::new(Context::default()));

pub fn put(key: &'static str, value: impl Into<String>) {
    let value = value.into();
    CONTEXT.with(|c| {
        c.borrow_mut().properties.insert(key, value);
    });
}

#[must_use]
pub fn get(key: &str) -> Option<String> {
    CONTEXT.with(|c| c.borrow().properties.get(key).cloned())
}

/// Copy of the current coroutine's properties
#[must_use]
pub fn snapshot() -> BTreeMap<String, String> {
    CONTEXT.with(|c| {
        c.borrow()
            .properties
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    })
}

/// Span of the request dispatched by the current coroutine, if any
#[must_use]
pub fn current_span() -> Span {
    CONTEXT.with(|c| c.borrow().span.clone().unwrap_or_else(Span::none))
}

pub fn clear() {
    CONTEXT.with(|c| {
        let mut context = c.borrow_mut();
        context.properties.clear();
        context.span = None;
    });
}

/// Active log context of one request
pub struct LogContextGuard {
    span: Span,
}

impl LogContextGuard {
    /// Record the resolved module and action
    pub fn set_action(&self, module: &str, action: &str) {
        put(MODULE, module);
        put(ACTION, action);
        self.span.record("module", module);
        self.span.record("action", action);
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for LogContextGuard {
    fn drop(&mut self) {
        clear();
    }
}

/// Install the log context for `request` on the current coroutine
#[must_use]
pub fn enter(request: &AjaxRequest) -> LogContextGuard {
    let span = tracing::info_span!(
        "ajax_request",
        request_id = %request.request_id,
        module = tracing::field::Empty,
        action = tracing::field::Empty,
    );
    CONTEXT.with(|c| {
        let mut context = c.borrow_mut();
        context.properties.clear();
        context
            .properties
            .insert(REQUEST_ID, request.request_id.to_string());
        context.span = Some(span.clone());
    });
    LogContextGuard { span }
}

/// Query string of `request` as it may be logged.
///
/// Parameters are sorted by name, values of credential-like parameters are
/// masked and the `json` parameter is left out.
#[must_use]
pub fn sanitized_query_string(request: &AjaxRequest, redactor: &Redactor) -> String {
    let mut names: Vec<&String> = request
        .parameters()
        .keys()
        .filter(|n| n.as_str() != SKIPPED_PARAMETER)
        .collect();
    names.sort();

    let mut out = String::new();
    for name in names {
        let Some(value) = request.parameter(name) else {
            continue;
        };
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&urlencoding::encode(name));
        out.push('=');
        out.push_str(&urlencoding::encode(&redactor.apply(name, value)));
    }
    out
}
