#![allow(dead_code)]

pub mod handlers {
    use ajaxdispatch::error::{ActionError, DispatchError};
    use ajaxdispatch::handler::{ActionFactory, ActionHandler, ActionNotes, ActionOutcome};
    use ajaxdispatch::request::AjaxRequest;
    use ajaxdispatch::session::Session;
    use std::collections::HashMap;
    use std::sync::Arc;

    type Script =
        dyn Fn(&mut AjaxRequest, &Session) -> Result<ActionOutcome, ActionError> + Send + Sync;

    /// Handler whose behavior is a closure
    pub struct Scripted {
        script: Box<Script>,
        notes: Option<ActionNotes>,
    }

    impl Scripted {
        pub fn new<F>(script: F) -> Self
        where
            F: Fn(&mut AjaxRequest, &Session) -> Result<ActionOutcome, ActionError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                script: Box::new(script),
                notes: None,
            }
        }

        pub fn with_notes(mut self, notes: ActionNotes) -> Self {
            self.notes = Some(notes);
            self
        }
    }

    impl ActionHandler for Scripted {
        fn perform(
            &self,
            request: &mut AjaxRequest,
            session: &Session,
        ) -> Result<ActionOutcome, ActionError> {
            (self.script)(request, session)
        }

        fn notes(&self) -> Option<ActionNotes> {
            self.notes
        }
    }

    /// Factory serving a fixed set of actions
    #[derive(Default)]
    pub struct MapFactory {
        actions: HashMap<String, Arc<dyn ActionHandler>>,
        combinable: bool,
    }

    impl MapFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn action(mut self, name: &str, handler: impl ActionHandler + 'static) -> Self {
            self.actions.insert(name.to_string(), Arc::new(handler));
            self
        }

        pub fn shared_action(mut self, name: &str, handler: Arc<dyn ActionHandler>) -> Self {
            self.actions.insert(name.to_string(), handler);
            self
        }

        pub fn combinable(mut self) -> Self {
            self.combinable = true;
            self
        }

        pub fn into_arc(self) -> Arc<dyn ActionFactory> {
            Arc::new(self)
        }
    }

    impl ActionFactory for MapFactory {
        fn create_action(
            &self,
            action: &str,
        ) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError> {
            Ok(self.actions.get(action).cloned())
        }

        fn combinable(&self) -> bool {
            self.combinable
        }
    }

    pub fn session() -> Session {
        Session::new("test-session", 17, 4)
    }
}

pub mod spies {
    use ajaxdispatch::customizer::{Customizer, CustomizerFactory, ExceptionHandler, Step};
    use ajaxdispatch::error::DispatchError;
    use ajaxdispatch::request::AjaxRequest;
    use ajaxdispatch::result::AjaxResult;
    use ajaxdispatch::session::Session;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Shared, ordered record of hook calls
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub fn call_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Customizer that records every hook call as `<name>:in` / `<name>:out`
    pub struct Recording {
        name: String,
        log: CallLog,
        /// Number of incoming calls to answer with `Later` before proceeding
        defer_incoming: AtomicUsize,
    }

    impl Recording {
        pub fn new(name: &str, log: &CallLog) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                defer_incoming: AtomicUsize::new(0),
            }
        }

        pub fn deferring(self, times: usize) -> Self {
            self.defer_incoming.store(times, Ordering::SeqCst);
            self
        }
    }

    impl Customizer for Recording {
        fn incoming(
            &self,
            _request: &mut AjaxRequest,
            _session: &Session,
        ) -> Result<Step, DispatchError> {
            let left = self.defer_incoming.load(Ordering::SeqCst);
            if left > 0 {
                self.defer_incoming.store(left - 1, Ordering::SeqCst);
                self.log.lock().push(format!("{}:later", self.name));
                return Ok(Step::Later(format!("{} not ready", self.name)));
            }
            self.log.lock().push(format!("{}:in", self.name));
            Ok(Step::Proceed)
        }

        fn outgoing(
            &self,
            _request: &AjaxRequest,
            _result: &mut AjaxResult,
            _session: &Session,
        ) -> Result<Step, DispatchError> {
            self.log.lock().push(format!("{}:out", self.name));
            Ok(Step::Proceed)
        }

        fn as_exception_handler(&self) -> Option<&dyn ExceptionHandler> {
            Some(self)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    impl ExceptionHandler for Recording {
        fn exception_occurred(&self, _: &AjaxRequest, _: &Session, error: &DispatchError) {
            self.log
                .lock()
                .push(format!("{}:exception:{}", self.name, error.code()));
        }
    }

    /// Factory handing out one fresh [`Recording`] per request and counting calls
    pub struct RecordingFactory {
        name: String,
        log: CallLog,
        defer_incoming: usize,
        pub created: AtomicUsize,
    }

    impl RecordingFactory {
        pub fn new(name: &str, log: &CallLog) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                defer_incoming: 0,
                created: AtomicUsize::new(0),
            }
        }

        pub fn deferring(mut self, times: usize) -> Self {
            self.defer_incoming = times;
            self
        }

        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl CustomizerFactory for RecordingFactory {
        fn create_customizer(
            &self,
            _request: &AjaxRequest,
            _session: &Session,
        ) -> Option<Arc<dyn Customizer>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(
                Recording::new(&self.name, &self.log).deferring(self.defer_incoming),
            ))
        }
    }
}

pub mod logs {
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::fmt::MakeWriter;

    /// In-memory log sink for asserting on emitted events
    #[derive(Clone, Default)]
    pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Capture every event emitted on the current thread while the guard lives
    pub fn capture() -> (LogBuffer, DefaultGuard) {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        (buffer, tracing::subscriber::set_default(subscriber))
    }
}

pub mod runtime {
    use std::sync::Once;

    /// Ensures May coroutines are configured only once
    static MAY_INIT: Once = Once::new();

    pub fn setup_may_runtime() {
        MAY_INIT.call_once(|| {
            may::config().set_stack_size(0x8000);
        });
    }
}
