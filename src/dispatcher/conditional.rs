//! HTTP conditional-request evaluation.
//!
//! Evaluated after the action is resolved and before it runs, first match
//! wins:
//!
//! 1. `If-Match` the handler confirms → 412
//! 2. `If-Unmodified-Since` the handler confirms → 412
//! 3. `If-None-Match` the handler confirms → not modified
//! 4. `If-Modified-Since`, only without an ETag, the handler confirms → not modified
//!
//! `*` matches any ETag. Timestamps get one second of clock skew added before
//! they are handed to the handler.

use crate::error::DispatchError;
use crate::handler::{ActionHandler, ETagAware};
use crate::log_context;
use crate::request::AjaxRequest;
use crate::result::AjaxResult;
use crate::session::Session;
use tracing::debug;

/// Added to client timestamps; HTTP dates have second precision
pub(crate) const CLOCK_SKEW_MS: i64 = 1000;

const ANY_ETAG: &str = "*";

/// Short-circuit result for the conditional headers of `request`, if any applies
pub(crate) fn evaluate(
    handler: &dyn ActionHandler,
    request: &AjaxRequest,
    session: &Session,
) -> Result<Option<AjaxResult>, DispatchError> {
    if let Some(failed) = check_preconditions(handler, request, session)? {
        return Ok(Some(failed));
    }
    check_not_modified(handler, request, session)
}

fn etag_matches(
    aware: &dyn ETagAware,
    tag: &str,
    request: &AjaxRequest,
    session: &Session,
) -> Result<bool, DispatchError> {
    if tag == ANY_ETAG {
        return Ok(true);
    }
    aware.check_etag(tag, request, session)
}

fn check_preconditions(
    handler: &dyn ActionHandler,
    request: &AjaxRequest,
    session: &Session,
) -> Result<Option<AjaxResult>, DispatchError> {
    if let (Some(tag), Some(aware)) = (request.if_match(), handler.as_etag_aware()) {
        if etag_matches(aware, tag, request, session)? {
            debug!(
                parent: &log_context::current_span(),
                module = %request.module(),
                action = %request.action(),
                "If-Match precondition failed"
            );
            return Ok(Some(AjaxResult::precondition_failed()));
        }
    }

    if let (Some(since), Some(aware)) = (
        request.if_unmodified_since(),
        handler.as_last_modified_aware(),
    ) {
        if since >= 0 && aware.check_last_modified(since + CLOCK_SKEW_MS, request, session)? {
            debug!(
                parent: &log_context::current_span(),
                module = %request.module(),
                action = %request.action(),
                "If-Unmodified-Since precondition failed"
            );
            return Ok(Some(AjaxResult::precondition_failed()));
        }
    }
    Ok(None)
}

/// Expiry hint of a not-modified answer; only positive values are passed on
fn positive_expiry(request: &AjaxRequest) -> Option<i64> {
    request.expires().filter(|e| *e > 0)
}

fn check_not_modified(
    handler: &dyn ActionHandler,
    request: &AjaxRequest,
    session: &Session,
) -> Result<Option<AjaxResult>, DispatchError> {
    let etag = request.etag();
    if let (Some(tag), Some(aware)) = (etag, handler.as_etag_aware()) {
        if etag_matches(aware, tag, request, session)? {
            return Ok(Some(AjaxResult::not_modified(positive_expiry(request))));
        }
    }

    // If-Modified-Since is ignored whenever an ETag was sent
    if etag.is_some() {
        return Ok(None);
    }
    if let (Some(since), Some(aware)) = (request.last_modified(), handler.as_last_modified_aware()) {
        if since >= 0 && aware.check_last_modified(since + CLOCK_SKEW_MS, request, session)? {
            return Ok(Some(AjaxResult::not_modified(positive_expiry(request))));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use crate::handler::{ActionOutcome, LastModifiedAware};
    use crate::result::ResultKind;
    use http::StatusCode;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Data last changed at `modified`; current ETag is `"v2"`
    struct Cached {
        modified: i64,
        seen: AtomicI64,
    }

    impl Cached {
        fn new(modified: i64) -> Self {
            Self {
                modified,
                seen: AtomicI64::new(-1),
            }
        }
    }

    impl ActionHandler for Cached {
        fn perform(
            &self,
            _request: &mut AjaxRequest,
            _session: &Session,
        ) -> Result<ActionOutcome, ActionError> {
            unreachable!("conditional checks never run the handler")
        }

        fn as_etag_aware(&self) -> Option<&dyn ETagAware> {
            Some(self)
        }

        fn as_last_modified_aware(&self) -> Option<&dyn LastModifiedAware> {
            Some(self)
        }
    }

    impl ETagAware for Cached {
        fn check_etag(
            &self,
            etag: &str,
            _request: &AjaxRequest,
            _session: &Session,
        ) -> Result<bool, DispatchError> {
            Ok(etag == "\"v2\"")
        }
    }

    impl LastModifiedAware for Cached {
        fn check_last_modified(
            &self,
            timestamp: i64,
            _request: &AjaxRequest,
            _session: &Session,
        ) -> Result<bool, DispatchError> {
            self.seen.store(timestamp, Ordering::SeqCst);
            Ok(self.modified <= timestamp)
        }
    }

    struct Plain;

    impl ActionHandler for Plain {
        fn perform(
            &self,
            _request: &mut AjaxRequest,
            _session: &Session,
        ) -> Result<ActionOutcome, ActionError> {
            unreachable!()
        }
    }

    fn session() -> Session {
        Session::new("s", 1, 1)
    }

    #[test]
    fn test_matching_etag_is_not_modified() {
        let req = AjaxRequest::new("files", "get")
            .with_etag("\"v2\"")
            .with_expires(5000);
        let result = evaluate(&Cached::new(0), &req, &session()).unwrap().unwrap();
        assert_eq!(result.kind(), ResultKind::ETag);
        assert_eq!(result.expires(), Some(5000));
    }

    #[test]
    fn test_non_positive_expiry_is_dropped() {
        for expires in [0, -1] {
            let req = AjaxRequest::new("files", "get")
                .with_etag("\"v2\"")
                .with_expires(expires);
            let result = evaluate(&Cached::new(0), &req, &session()).unwrap().unwrap();
            assert_eq!(result.kind(), ResultKind::ETag);
            assert_eq!(result.expires(), None);
        }
    }

    #[test]
    fn test_stale_etag_falls_through() {
        let req = AjaxRequest::new("files", "get").with_etag("\"v1\"");
        assert!(evaluate(&Cached::new(0), &req, &session()).unwrap().is_none());
    }

    #[test]
    fn test_wildcard_matches_any_etag() {
        let req = AjaxRequest::new("files", "get").with_etag("*");
        let result = evaluate(&Cached::new(0), &req, &session()).unwrap().unwrap();
        assert_eq!(result.kind(), ResultKind::ETag);
    }

    #[test]
    fn test_if_match_wins_over_if_none_match() {
        let req = AjaxRequest::new("files", "update")
            .with_header("If-Match", "\"v2\"")
            .with_etag("\"v2\"");
        let result = evaluate(&Cached::new(0), &req, &session()).unwrap().unwrap();
        assert_eq!(result.status(), Some(StatusCode::PRECONDITION_FAILED));
        assert_eq!(result.kind(), ResultKind::Normal);
    }

    #[test]
    fn test_if_unmodified_since_adds_skew() {
        let handler = Cached::new(784_111_777_500);
        let req = AjaxRequest::new("files", "update")
            .with_header("If-Unmodified-Since", "Sun, 06 Nov 1994 08:49:37 GMT");
        let result = evaluate(&handler, &req, &session()).unwrap().unwrap();
        assert_eq!(result.status(), Some(StatusCode::PRECONDITION_FAILED));
        assert_eq!(handler.seen.load(Ordering::SeqCst), 784_111_777_000 + CLOCK_SKEW_MS);
    }

    #[test]
    fn test_if_modified_since_ignored_with_etag() {
        let handler = Cached::new(0);
        let req = AjaxRequest::new("files", "get")
            .with_etag("\"v1\"")
            .with_last_modified(10_000);
        assert!(evaluate(&handler, &req, &session()).unwrap().is_none());
        assert_eq!(handler.seen.load(Ordering::SeqCst), -1);

        let req = AjaxRequest::new("files", "get").with_last_modified(10_000);
        let result = evaluate(&handler, &req, &session()).unwrap().unwrap();
        assert_eq!(result.kind(), ResultKind::ETag);
        assert_eq!(result.expires(), None);
    }

    #[test]
    fn test_unaware_handler_ignores_headers() {
        let req = AjaxRequest::new("files", "get")
            .with_etag("*")
            .with_header("If-Match", "*")
            .with_last_modified(1);
        assert!(evaluate(&Plain, &req, &session()).unwrap().is_none());
    }
}
