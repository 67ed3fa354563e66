//! End-to-end tests for `Dispatcher::perform`
//!
//! # Test Coverage
//!
//! - Resolution: exact module, prefix fallback, unknown module/action
//! - Handler outcomes: results, continuations, missing results, panics
//! - Error translation: structured errors, SSL trust, TLS causes, unchecked errors
//! - Listeners, annotation processors and upload cleanup
//! - Metrics: one sample per call, labelled with the resolved module/action

mod common;

use ajaxdispatch::dispatcher::Dispatcher;
use ajaxdispatch::error::{ActionError, Category, DispatchError, ErrorCode, TlsError};
use ajaxdispatch::handler::{ActionHandler, AnnotationProcessor, Continuation};
use ajaxdispatch::handler::{ActionNotes, ActionOutcome};
use ajaxdispatch::listener::DispatcherListener;
use ajaxdispatch::request::{AjaxRequest, RequestBody};
use ajaxdispatch::result::{AjaxResult, ContinuationToken, ResultKind};
use ajaxdispatch::session::{Session, TrustConfiguration};
use common::handlers::{session, MapFactory, Scripted};
use common::logs;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

fn echo() -> Scripted {
    Scripted::new(|request, _| {
        Ok(AjaxResult::new(json!({
            "module": request.module(),
            "action": request.action(),
            "format": request.format(),
        }))
        .into())
    })
}

fn failing(error: DispatchError) -> Scripted {
    Scripted::new(move |_, _| Err(ActionError::Dispatch(error.clone())))
}

#[test]
fn test_perform_returns_handler_result() {
    let dispatcher = Dispatcher::default();
    dispatcher.register("mail", MapFactory::new().action("get", echo()).into_arc());

    let result = dispatcher
        .perform(AjaxRequest::new("mail", "get"), Some(&session()))
        .unwrap();

    assert_eq!(result.kind(), ResultKind::Normal);
    assert_eq!(
        result.payload(),
        &json!({ "module": "mail", "action": "get", "format": "apiResponse" })
    );
    let sample = dispatcher.metrics().get("mail", "get", "OK").unwrap();
    assert_eq!(sample.count, 1);
}

#[test]
fn test_module_prefix_fallback() {
    let dispatcher = Dispatcher::default();
    dispatcher.register("mail", MapFactory::new().action("all", echo()).into_arc());

    let result = dispatcher
        .perform(AjaxRequest::new("mail/folders/inbox", "all"), Some(&session()))
        .unwrap();
    assert_eq!(result.payload()["module"], json!("mail/folders/inbox"));
    // Metrics use the module the factory is registered under
    assert!(dispatcher.metrics().get("mail", "all", "OK").is_some());
    assert!(dispatcher.handles("mail"));
    assert!(!dispatcher.handles("mail/folders/inbox"));
    assert!(dispatcher.lookup_factory("mail/folders/inbox").is_some());
}

#[test]
fn test_unknown_module_and_action() {
    let dispatcher = Dispatcher::default();
    dispatcher.register("mail", MapFactory::new().action("get", echo()).into_arc());

    let err = dispatcher
        .perform(AjaxRequest::new("calendar", "get"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownModule);
    assert_eq!(err.args(), &["calendar".to_string()]);

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "explode"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownActionInModule);
    assert_eq!(err.message(), "Unknown action \"explode\" in module \"mail\"");

    let metrics = dispatcher.metrics();
    assert_eq!(metrics.get("UNKNOWN", "UNKNOWN", "USER_INPUT").unwrap().count, 1);
    assert_eq!(metrics.get("mail", "UNKNOWN", "USER_INPUT").unwrap().count, 1);
}

#[test]
fn test_missing_session_runs_nothing() {
    let dispatcher = Dispatcher::default();
    let called = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&called);
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action(
                "get",
                Scripted::new(move |_, _| {
                    *flag.lock() = true;
                    Ok(AjaxResult::new(json!(null)).into())
                }),
            )
            .into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "get"), None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingParameter);
    assert_eq!(err.args(), &["session".to_string()]);
    assert!(!*called.lock());
}

#[test]
fn test_structured_handler_error_propagates() {
    let dispatcher = Dispatcher::default();
    let conflict = DispatchError::new(ErrorCode::AlreadyRunning)
        .with_args(vec!["j".into(), "1".into(), "2".into()]);
    dispatcher.register(
        "mail",
        MapFactory::new().action("move", failing(conflict)).into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "move"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyRunning);
    assert_eq!(err.category(), Category::Conflict);
    assert_eq!(
        dispatcher.metrics().get("mail", "move", "CONFLICT").unwrap().count,
        1
    );
}

#[test]
fn test_unchecked_error_becomes_unexpected_and_logs_sanitized_query() {
    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action(
                "send",
                Scripted::new(|_, _| Err(anyhow::anyhow!("smtp connection reset").into())),
            )
            .into_arc(),
    );

    let (logs, _guard) = logs::capture();
    let request = AjaxRequest::new("mail", "send")
        .with_parameter("folder", "INBOX")
        .with_parameter("password", "hunter2")
        .with_parameter("json", "{\"large\":true}");
    let err = dispatcher.perform(request, Some(&session())).unwrap_err();

    assert_eq!(err.code(), ErrorCode::UnexpectedError);
    assert!(err.message().contains("smtp connection reset"));

    let output = logs.contents();
    assert!(output.contains("folder=INBOX"));
    assert!(!output.contains("hunter2"));
    assert!(!output.contains("large"));
}

#[test]
fn test_handler_panic_is_contained() {
    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action("crash", Scripted::new(|_, _| panic!("index out of range")))
            .into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "crash"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnexpectedError);
    assert!(err.message().contains("index out of range"));
    assert_eq!(
        dispatcher.metrics().get("mail", "crash", "ERROR").unwrap().count,
        1
    );
}

#[test]
fn test_missing_result_is_unexpected_result() {
    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action("noop", Scripted::new(|_, _| Ok(ActionOutcome::NoResult)))
            .into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "noop"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnexpectedResult);
    assert_eq!(err.args(), &["AjaxResult".to_string(), "null".to_string()]);
}

#[test]
fn test_continuation_token_only_while_incomplete() {
    let token = ContinuationToken::new();
    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "search",
        MapFactory::new()
            .action(
                "run",
                Scripted::new(move |request, _| {
                    Ok(ActionOutcome::Continuation(Continuation {
                        token,
                        value: json!({ "partial": true }),
                        format: "json".into(),
                        timestamp: Some(1_700_000_000_000),
                        completed: request.bool_parameter("done"),
                    }))
                }),
            )
            .into_arc(),
    );

    let pending = dispatcher
        .perform(AjaxRequest::new("search", "run"), Some(&session()))
        .unwrap();
    assert_eq!(pending.continuation(), Some(token));
    assert_eq!(pending.timestamp(), Some(1_700_000_000_000));
    assert_eq!(pending.kind(), ResultKind::Normal);

    let done = dispatcher
        .perform(
            AjaxRequest::new("search", "run").with_parameter("done", "true"),
            Some(&session()),
        )
        .unwrap();
    assert_eq!(done.continuation(), None);
    assert_eq!(done.payload(), &json!({ "partial": true }));
}

struct UserConfigurableTrust;

impl TrustConfiguration for UserConfigurableTrust {
    fn may_define_trust_level(&self, session: &Session) -> bool {
        session.user_id() == 17
    }
}

fn untrusted() -> DispatchError {
    DispatchError::new(ErrorCode::UntrustedCertificate).with_arg("imap.example.com")
}

#[test]
fn test_ssl_error_with_user_trust_configuration() {
    let dispatcher = Dispatcher::default().with_trust_configuration(Arc::new(UserConfigurableTrust));
    dispatcher.register(
        "mail",
        MapFactory::new().action("get", failing(untrusted())).into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "get"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UntrustedCertUserConfig);
    assert_eq!(err.args(), &["imap.example.com".to_string()]);

    // Another user may not configure trust: the original error stays
    let other = Session::new("other", 99, 4);
    let err = dispatcher
        .perform(AjaxRequest::new("mail", "get"), Some(&other))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UntrustedCertificate);
}

#[test]
fn test_ssl_error_without_trust_configuration() {
    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "mail",
        MapFactory::new().action("get", failing(untrusted())).into_arc(),
    );
    let err = dispatcher
        .perform(AjaxRequest::new("mail", "get"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UntrustedCertificate);
    assert_eq!(err.category(), Category::Connectivity);
}

#[test]
fn test_tls_cause_surfaces_root_error() {
    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action(
                "sync",
                Scripted::new(|_, _| {
                    let tls = TlsError::new("handshake failed").caused_by(
                        DispatchError::new(ErrorCode::UntrustedCertificate)
                            .with_arg("smtp.example.com"),
                    );
                    Err(ActionError::Dispatch(
                        DispatchError::unexpected("sync failed").with_source(tls),
                    ))
                }),
            )
            .action(
                "fetch",
                Scripted::new(|_, _| {
                    let tls = TlsError::new("bad certificate")
                        .caused_by(DispatchError::unknown_module("remote"));
                    Err(anyhow::Error::new(tls).into())
                }),
            )
            .into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "sync"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UntrustedCertificate);
    assert_eq!(err.args(), &["smtp.example.com".to_string()]);

    let err = dispatcher
        .perform(AjaxRequest::new("mail", "fetch"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownModule);
}

#[test]
fn test_json_body_loaded_unless_streamed() {
    let dispatcher = Dispatcher::default();
    let kind = |request: &mut AjaxRequest, _: &Session| -> Result<ActionOutcome, ActionError> {
        let loaded = match request.body() {
            Some(RequestBody::Json(v)) => v.clone(),
            Some(RequestBody::Text(t)) => json!(t),
            _ => json!(null),
        };
        Ok(AjaxResult::new(loaded).into())
    };
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action("eager", Scripted::new(kind))
            .action(
                "stream",
                Scripted::new(kind).with_notes(ActionNotes::default().prefer_stream()),
            )
            .into_arc(),
    );

    let result = dispatcher
        .perform(
            AjaxRequest::new("mail", "eager").with_raw_body(br#"{"to":"a@b.c"}"#.to_vec()),
            Some(&session()),
        )
        .unwrap();
    assert_eq!(result.payload(), &json!({ "to": "a@b.c" }));

    let result = dispatcher
        .perform(
            AjaxRequest::new("mail", "stream").with_raw_body(br#"{"to":"a@b.c"}"#.to_vec()),
            Some(&session()),
        )
        .unwrap();
    assert_eq!(result.payload(), &json!(null));

    let err = dispatcher
        .perform(
            AjaxRequest::new("mail", "eager").with_raw_body(b"{broken".to_vec()),
            Some(&session()),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidJsonRequestBody);
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl DispatcherListener for RecordingListener {
    fn applies_to(&self, request: &AjaxRequest) -> bool {
        request.module() == "mail"
    }

    fn on_request_initialized(&self, request: &AjaxRequest) {
        self.events.lock().push(format!("init:{}", request.action()));
    }

    fn on_request_performed(
        &self,
        request: &AjaxRequest,
        result: Option<&AjaxResult>,
        error: Option<&DispatchError>,
    ) {
        let outcome = match (result, error) {
            (Some(_), None) => "ok".to_string(),
            (None, Some(e)) => e.code().to_string(),
            _ => "invalid".to_string(),
        };
        self.events
            .lock()
            .push(format!("performed:{}:{outcome}", request.action()));
    }

    fn on_result_returned(&self, _result: &AjaxResult, error: Option<&DispatchError>) {
        self.events
            .lock()
            .push(format!("returned:{}", error.is_none()));
    }
}

#[test]
fn test_listeners_bracket_handler_calls() {
    let dispatcher = Dispatcher::default();
    let listener = Arc::new(RecordingListener::default());
    assert!(dispatcher.add_listener(Arc::clone(&listener) as Arc<dyn DispatcherListener>));
    dispatcher.register(
        "mail",
        MapFactory::new()
            .action("get", echo())
            .action("fail", failing(DispatchError::unknown_module("x")))
            .into_arc(),
    );
    dispatcher.register("calendar", MapFactory::new().action("get", echo()).into_arc());

    let result = dispatcher
        .perform(AjaxRequest::new("mail", "get"), Some(&session()))
        .unwrap();
    assert_eq!(result.post_processor_count(), 1);
    result.signal_done(None);

    dispatcher
        .perform(AjaxRequest::new("mail", "fail"), Some(&session()))
        .unwrap_err();

    let other = dispatcher
        .perform(AjaxRequest::new("calendar", "get"), Some(&session()))
        .unwrap();
    assert_eq!(other.post_processor_count(), 0);

    assert_eq!(
        *listener.events.lock(),
        vec![
            "init:get",
            "performed:get:ok",
            "returned:true",
            "init:fail",
            "performed:fail:AJAX-0002",
        ]
    );

    let handle = Arc::clone(&listener) as Arc<dyn DispatcherListener>;
    assert!(dispatcher.remove_listener(&handle));
    assert!(!dispatcher.remove_listener(&handle));
}

struct RequiresAdmin;

impl AnnotationProcessor for RequiresAdmin {
    fn handles(&self, handler: &dyn ActionHandler) -> bool {
        handler.notes().is_some_and(|n| n.no_secret_callback)
    }

    fn process(
        &self,
        _handler: &dyn ActionHandler,
        request: &mut AjaxRequest,
        _session: &Session,
    ) -> Result<(), DispatchError> {
        if request.parameter("admin").is_some() {
            Ok(())
        } else {
            Err(DispatchError::missing_parameter("admin"))
        }
    }
}

#[test]
fn test_annotation_processors_run_for_marked_handlers() {
    let dispatcher = Dispatcher::default();
    let processor: Arc<dyn AnnotationProcessor> = Arc::new(RequiresAdmin);
    assert!(dispatcher.add_annotation_processor(Arc::clone(&processor)));
    assert!(!dispatcher.add_annotation_processor(Arc::clone(&processor)));
    dispatcher.register(
        "admin",
        MapFactory::new()
            .action(
                "reset",
                echo().with_notes(ActionNotes::default().no_secret_callback()),
            )
            .action("status", echo())
            .into_arc(),
    );

    let err = dispatcher
        .perform(AjaxRequest::new("admin", "reset"), Some(&session()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingParameter);

    dispatcher
        .perform(
            AjaxRequest::new("admin", "reset").with_parameter("admin", "1"),
            Some(&session()),
        )
        .unwrap();
    dispatcher
        .perform(AjaxRequest::new("admin", "status"), Some(&session()))
        .unwrap();

    assert!(dispatcher.remove_annotation_processor(&processor));
    dispatcher
        .perform(AjaxRequest::new("admin", "reset"), Some(&session()))
        .unwrap();
}

#[test]
fn test_uploads_removed_on_every_path() {
    let dir = tempfile::tempdir().unwrap();
    let ok_upload = dir.path().join("ok.bin");
    let failed_upload = dir.path().join("failed.bin");
    let unresolved_upload = dir.path().join("unresolved.bin");
    for path in [&ok_upload, &failed_upload, &unresolved_upload] {
        std::fs::write(path, b"payload").unwrap();
    }

    let dispatcher = Dispatcher::default();
    dispatcher.register(
        "infostore",
        MapFactory::new()
            .action("upload", echo())
            .action("fail", failing(DispatchError::unexpected("disk full")))
            .into_arc(),
    );

    dispatcher
        .perform(
            AjaxRequest::new("infostore", "upload").with_upload(&ok_upload),
            Some(&session()),
        )
        .unwrap();
    dispatcher
        .perform(
            AjaxRequest::new("infostore", "fail").with_upload(&failed_upload),
            Some(&session()),
        )
        .unwrap_err();
    dispatcher
        .perform(
            AjaxRequest::new("unknown", "upload").with_upload(&unresolved_upload),
            Some(&session()),
        )
        .unwrap_err();

    assert!(!ok_upload.exists());
    assert!(!failed_upload.exists());
    assert!(!unresolved_upload.exists());
}

#[test]
fn test_state_initialized_once_per_module() {
    use ajaxdispatch::handler::ActionFactory;
    use ajaxdispatch::request::AjaxState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Initializing {
        inner: MapFactory,
        calls: AtomicUsize,
    }

    impl ActionFactory for Initializing {
        fn create_action(
            &self,
            action: &str,
        ) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError> {
            self.inner.create_action(action)
        }

        fn initialize_state(&self, state: &mut AjaxState) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            state.put("initialized", json!(true));
        }
    }

    let factory = Arc::new(Initializing {
        inner: MapFactory::new().action(
            "get",
            Scripted::new(|request, _| {
                Ok(AjaxResult::new(request.state().get("initialized").cloned().unwrap_or_default())
                    .into())
            }),
        ),
        calls: AtomicUsize::new(0),
    });
    let dispatcher = Dispatcher::default();
    dispatcher.register("mail", Arc::clone(&factory) as Arc<dyn ActionFactory>);

    let result = dispatcher
        .perform(AjaxRequest::new("mail", "get"), Some(&session()))
        .unwrap();
    assert_eq!(result.payload(), &json!(true));
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
}
