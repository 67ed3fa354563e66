//! # Body Module
//!
//! Turns the raw bytes a transport delivered into a [`RequestBody`].
//!
//! The dispatcher loads the body eagerly unless the resolved action prefers to
//! read the stream itself. [`DefaultBodyReader`] applies these rules:
//!
//! 1. A body that is already loaded is left alone
//! 2. If the first non-whitespace byte is `[` or `{`, the body is parsed as
//!    JSON; a parse failure is `INVALID_JSON_REQUEST_BODY`
//! 3. Any other non-empty body is kept as text (UTF-8, lossy on invalid bytes)
//! 4. An empty body falls back to the URL-encoded `data` parameter, with the
//!    same JSON detection
//! 5. Otherwise the body is [`RequestBody::Empty`]

use crate::error::{DispatchError, ErrorCode};
use crate::request::{AjaxRequest, RequestBody, PARAMETER_DATA};
use std::borrow::Cow;
use tracing::debug;

/// Materializes a request body
pub trait BodyReader: Send + Sync {
    fn load(&self, request: &mut AjaxRequest) -> Result<(), DispatchError>;
}

/// The stock [`BodyReader`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBodyReader;

fn looks_like_json(text: &str) -> bool {
    matches!(text.trim_start().as_bytes().first(), Some(b'[' | b'{'))
}

fn parse_text(text: &str) -> Result<RequestBody, DispatchError> {
    if looks_like_json(text) {
        serde_json::from_str(text).map(RequestBody::Json).map_err(|e| {
            DispatchError::new(ErrorCode::InvalidJsonRequestBody)
                .with_arg(e.to_string())
                .with_source(e)
        })
    } else {
        Ok(RequestBody::Text(text.to_string()))
    }
}

impl BodyReader for DefaultBodyReader {
    fn load(&self, request: &mut AjaxRequest) -> Result<(), DispatchError> {
        if request.is_body_loaded() {
            return Ok(());
        }

        let raw = request.take_raw_body().unwrap_or_default();
        let body = if raw.iter().any(|b| !b.is_ascii_whitespace()) {
            let text = String::from_utf8_lossy(&raw);
            if let Cow::Owned(_) = text {
                debug!(
                    request_id = %request.request_id,
                    "Request body is not valid UTF-8, decoded lossily"
                );
            }
            parse_text(&text)?
        } else if let Some(data) = request.parameter(PARAMETER_DATA) {
            let decoded = urlencoding::decode(data)
                .map(Cow::into_owned)
                .unwrap_or_else(|_| data.to_string());
            parse_text(&decoded)?
        } else {
            RequestBody::Empty
        };

        request.set_body(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(mut req: AjaxRequest) -> Result<AjaxRequest, DispatchError> {
        DefaultBodyReader.load(&mut req)?;
        Ok(req)
    }

    #[test]
    fn test_json_object_and_array() {
        let req = load(AjaxRequest::new("m", "a").with_raw_body("  {\"id\": 7}")).unwrap();
        assert_eq!(req.body(), Some(&RequestBody::Json(json!({"id": 7}))));

        let req = load(AjaxRequest::new("m", "a").with_raw_body("[1,2]")).unwrap();
        assert_eq!(req.body(), Some(&RequestBody::Json(json!([1, 2]))));
    }

    #[test]
    fn test_invalid_json() {
        let err = load(AjaxRequest::new("m", "a").with_raw_body("{broken")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJsonRequestBody);
    }

    #[test]
    fn test_plain_text() {
        let req = load(AjaxRequest::new("m", "a").with_raw_body("hello")).unwrap();
        assert_eq!(req.body(), Some(&RequestBody::Text("hello".into())));
    }

    #[test]
    fn test_data_parameter_fallback() {
        let req = load(
            AjaxRequest::new("m", "a").with_parameter("data", "%7B%22folder%22%3A%22INBOX%22%7D"),
        )
        .unwrap();
        assert_eq!(
            req.body(),
            Some(&RequestBody::Json(json!({"folder": "INBOX"})))
        );
    }

    #[test]
    fn test_empty() {
        let req = load(AjaxRequest::new("m", "a").with_raw_body("   ")).unwrap();
        assert_eq!(req.body(), Some(&RequestBody::Empty));
    }

    #[test]
    fn test_loaded_body_untouched() {
        let mut req = AjaxRequest::new("m", "a").with_raw_body("{\"x\":1}");
        req.set_body(RequestBody::Text("kept".into()));
        DefaultBodyReader.load(&mut req).unwrap();
        assert_eq!(req.body(), Some(&RequestBody::Text("kept".into())));
    }
}
