use super::conditional;
use super::invocation::{panic_message, Failure, Invocation};
use crate::body::{BodyReader, DefaultBodyReader};
use crate::customizer::{CustomizerChain, CustomizerFactory};
use crate::error::{has_tls_cause, root_dispatch_error, DispatchError, ErrorCode};
use crate::handler::{
    ActionFactory, ActionHandler, ActionNotes, AnnotationProcessor, EnqueueDecision, JobKey,
};
use crate::job_queue::{already_running, EnqueueError, Job, JobQueue};
use crate::listener::{DispatcherListener, ListenerRegistry};
use crate::log_context::{self, LogContextGuard, QUERY_STRING};
use crate::metrics::{RequestMetrics, STATUS_OK, UNKNOWN};
use crate::notes_cache::NotesCache;
use crate::otel::Redactor;
use crate::registry::{ActionRegistry, Registration};
use crate::request::{AjaxRequest, PARAMETER_ALLOW_ENQUEUE, PARAMETER_SESSION};
use crate::result::AjaxResult;
use crate::runtime_config::DispatcherConfig;
use crate::session::{Session, TrustConfiguration};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Error code prefix of TLS certificate errors
const SSL_PREFIX: &str = "SSL";

/// Module/action a call is recorded under; `UNKNOWN` until resolved
struct MetricLabels {
    module: String,
    action: String,
}

impl MetricLabels {
    fn unknown() -> Self {
        Self {
            module: UNKNOWN.to_string(),
            action: UNKNOWN.to_string(),
        }
    }
}

/// Copy-on-write append; `false` if `item` is already present (by identity)
fn cow_add<T: ?Sized>(list: &ArcSwap<Vec<Arc<T>>>, lock: &Mutex<()>, item: Arc<T>) -> bool {
    let _guard = lock.lock();
    let current = list.load();
    if current.iter().any(|x| Arc::ptr_eq(x, &item)) {
        return false;
    }
    let mut next = Vec::with_capacity(current.len() + 1);
    next.extend(current.iter().cloned());
    next.push(item);
    list.store(Arc::new(next));
    true
}

fn cow_remove<T: ?Sized>(list: &ArcSwap<Vec<Arc<T>>>, lock: &Mutex<()>, item: &Arc<T>) -> bool {
    let _guard = lock.lock();
    let current = list.load();
    let next: Vec<_> = current
        .iter()
        .filter(|x| !Arc::ptr_eq(x, item))
        .cloned()
        .collect();
    if next.len() == current.len() {
        return false;
    }
    list.store(Arc::new(next));
    true
}

/// Routes requests to action handlers.
///
/// One dispatcher owns its registry, metadata cache, customizer factories,
/// annotation processors, listeners and metrics; nothing is process-global.
/// It holds no request-scoped state and is shared freely across threads.
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: ActionRegistry,
    notes: NotesCache,
    customizers: ArcSwap<Vec<Arc<dyn CustomizerFactory>>>,
    annotation_processors: ArcSwap<Vec<Arc<dyn AnnotationProcessor>>>,
    write_lock: Mutex<()>,
    listeners: Arc<ListenerRegistry>,
    metrics: RequestMetrics,
    job_queue: Option<Arc<dyn JobQueue>>,
    trust: Option<Arc<dyn TrustConfiguration>>,
    body_reader: Arc<dyn BodyReader>,
    redactor: Redactor,
    default_format: Arc<str>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        info!(
            notes_ttl_secs = config.notes_ttl.as_secs(),
            customizer_max_passes = config.customizer_max_passes,
            default_format = %config.default_format,
            "Creating dispatcher"
        );
        Self {
            notes: NotesCache::new(config.notes_ttl),
            default_format: Arc::from(config.default_format.as_str()),
            config,
            registry: ActionRegistry::new(),
            customizers: ArcSwap::from_pointee(Vec::new()),
            annotation_processors: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            listeners: Arc::new(ListenerRegistry::new()),
            metrics: RequestMetrics::new(),
            job_queue: None,
            trust: None,
            body_reader: Arc::new(DefaultBodyReader),
            redactor: Redactor::default(),
        }
    }

    /// Queue used for requests that opt into enqueue mode
    #[must_use]
    pub fn with_job_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.job_queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_trust_configuration(mut self, trust: Arc<dyn TrustConfiguration>) -> Self {
        self.trust = Some(trust);
        self
    }

    #[must_use]
    pub fn with_body_reader(mut self, reader: Arc<dyn BodyReader>) -> Self {
        self.body_reader = reader;
        self
    }

    /// Redaction applied to query strings written to the log context
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    // ---- Registry ------------------------------------------------------

    /// Register `factory` for `module`; see [`ActionRegistry::register`]
    pub fn register(&self, module: &str, factory: Arc<dyn ActionFactory>) -> Registration {
        let outcome = self.registry.register(module, factory);
        if outcome != Registration::Denied {
            self.notes.invalidate_module(module);
        }
        outcome
    }

    pub fn remove(&self, module: &str, factory: &Arc<dyn ActionFactory>) -> bool {
        let removed = self.registry.remove(module, factory);
        if removed {
            self.notes.invalidate_module(module);
        }
        removed
    }

    /// Whether a factory is registered for exactly `module`
    #[must_use]
    pub fn handles(&self, module: &str) -> bool {
        self.registry.handles(module)
    }

    /// Factory for `module`, falling back to its path prefixes
    #[must_use]
    pub fn lookup_factory(&self, module: &str) -> Option<Arc<dyn ActionFactory>> {
        self.registry.resolve(module).map(|(_, factory)| factory)
    }

    // ---- Action metadata -------------------------------------------------

    /// Cached notes of `module`/`action`; `None` for unknown modules and
    /// actions without notes
    fn action_notes(&self, module: &str, action: &str) -> Option<ActionNotes> {
        if let Some(notes) = self.notes.get(module, action) {
            return notes;
        }
        let factory = self.lookup_factory(module)?;
        self.notes.get_or_insert_with(module, action, || {
            match factory.create_action(action) {
                Ok(handler) => handler.and_then(|h| h.notes()),
                Err(e) => {
                    trace!(
                        module = %module,
                        action = %action,
                        factory = %factory.name(),
                        error = %e,
                        "Failed to create action for metadata lookup"
                    );
                    None
                }
            }
        })
    }

    #[must_use]
    pub fn may_use_fallback_session(&self, module: &str, action: &str) -> bool {
        self.action_notes(module, action)
            .is_some_and(|n| n.allow_public_session)
    }

    #[must_use]
    pub fn may_perform_public_session_auth(&self, module: &str, action: &str) -> bool {
        self.action_notes(module, action)
            .is_some_and(|n| n.public_session_auth)
    }

    #[must_use]
    pub fn may_omit_session(&self, module: &str, action: &str) -> bool {
        self.action_notes(module, action).is_some_and(|n| n.no_session)
    }

    #[must_use]
    pub fn no_secret_callback(&self, module: &str, action: &str) -> bool {
        self.action_notes(module, action)
            .is_some_and(|n| n.no_secret_callback)
    }

    // ---- Extension points --------------------------------------------------

    /// Add a customizer factory; `false` if it is already registered
    pub fn add_customizer(&self, factory: Arc<dyn CustomizerFactory>) -> bool {
        cow_add(&self.customizers, &self.write_lock, factory)
    }

    pub fn remove_customizer(&self, factory: &Arc<dyn CustomizerFactory>) -> bool {
        cow_remove(&self.customizers, &self.write_lock, factory)
    }

    /// Add an annotation processor; `false` if it is already registered
    pub fn add_annotation_processor(&self, processor: Arc<dyn AnnotationProcessor>) -> bool {
        cow_add(&self.annotation_processors, &self.write_lock, processor)
    }

    pub fn remove_annotation_processor(&self, processor: &Arc<dyn AnnotationProcessor>) -> bool {
        cow_remove(&self.annotation_processors, &self.write_lock, processor)
    }

    pub fn add_listener(&self, listener: Arc<dyn DispatcherListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DispatcherListener>) -> bool {
        self.listeners.remove(listener)
    }

    // ---- Dispatch ----------------------------------------------------------

    /// Dispatch `request` to its action.
    ///
    /// Every call is recorded in [`Dispatcher::metrics`] exactly once, under
    /// `UNKNOWN` module/action until they are resolved. Uploaded files of the
    /// request are deleted and the request's log context is cleared on every
    /// exit path.
    ///
    /// # Errors
    ///
    /// - `MISSING_PARAMETER` if `session` is `None`; nothing else runs
    /// - `UNKNOWN_MODULE` / `UNKNOWN_ACTION_IN_MODULE` if the action cannot be resolved
    /// - `ALREADY_RUNNING` if an equal job is in flight (enqueue mode)
    /// - any structured error raised by customizers, processors or the handler
    /// - `UNEXPECTED_ERROR` wrapping every other failure, panics included
    pub fn perform(
        &self,
        mut request: AjaxRequest,
        session: Option<&Session>,
    ) -> Result<AjaxResult, DispatchError> {
        let started = Instant::now();

        let Some(session) = session else {
            let error = DispatchError::missing_parameter(PARAMETER_SESSION);
            self.metrics
                .record(UNKNOWN, UNKNOWN, error.category().as_str(), started.elapsed());
            request.clean_uploads();
            debug!(request_id = %request.request_id, "Request without session rejected");
            return Err(error);
        };

        let log = log_context::enter(&request);
        let mut labels = MetricLabels::unknown();
        let mut chain = CustomizerChain::from_factories(
            &self.customizers.load(),
            &request,
            session,
            self.config.customizer_max_passes,
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(&mut request, session, &mut chain, &mut labels, &log)
        }))
        .unwrap_or_else(|panic| {
            let message = panic_message(&*panic);
            error!(
                parent: log.span(),
                panic_message = %message,
                "Panic while dispatching request"
            );
            Err(Failure::Unchecked(anyhow::anyhow!(
                "panic while dispatching: {message}"
            )))
        });

        let outcome = match outcome {
            Ok(result) => {
                self.metrics
                    .record(&labels.module, &labels.action, STATUS_OK, started.elapsed());
                Ok(result)
            }
            Err(failure) => {
                let error = self.translate(failure, &request, session, &chain);
                self.metrics.record(
                    &labels.module,
                    &labels.action,
                    error.category().as_str(),
                    started.elapsed(),
                );
                Err(error)
            }
        };

        request.clean_uploads();
        drop(log);
        outcome
    }

    fn dispatch(
        &self,
        request: &mut AjaxRequest,
        session: &Session,
        chain: &mut CustomizerChain,
        labels: &mut MetricLabels,
        log: &LogContextGuard,
    ) -> Result<AjaxResult, Failure> {
        chain.apply_incoming(request, session)?;
        log.set_action(request.module(), request.action());

        let (module, factory) = self
            .registry
            .resolve(request.module())
            .ok_or_else(|| DispatchError::unknown_module(request.module()))?;
        labels.module.clone_from(&module);

        let handler = factory
            .create_action(request.action())?
            .ok_or_else(|| DispatchError::unknown_action(request.action(), request.module()))?;
        labels.action = request.action().to_string();

        let notes = self
            .notes
            .get_or_insert_with(request.module(), request.action(), || handler.notes());
        if !notes.is_some_and(|n| n.prefer_stream) {
            self.body_reader.load(request)?;
        }

        if let Some(result) = conditional::evaluate(handler.as_ref(), request, session)? {
            return Ok(result);
        }

        for processor in self.annotation_processors.load().iter() {
            if processor.handles(handler.as_ref()) {
                processor.process(handler.as_ref(), request, session)?;
            }
        }

        let invocation = Invocation {
            handler,
            factory,
            module,
            listeners: Arc::clone(&self.listeners),
            default_format: Arc::clone(&self.default_format),
            redactor: self.redactor,
        };

        if request.bool_parameter(PARAMETER_ALLOW_ENQUEUE) {
            if let Some(queue) = &self.job_queue {
                let decision = enqueue_decision(invocation.handler.as_ref(), notes, request, session)?;
                if decision.is_enqueueable() {
                    return self.enqueue(
                        queue.as_ref(),
                        invocation,
                        decision.into_key(),
                        request,
                        session,
                        chain,
                    );
                }
            }
        }

        invocation.run(request, session, chain)
    }

    /// Hand the call to the job queue and wait a bounded time for it
    fn enqueue(
        &self,
        queue: &dyn JobQueue,
        invocation: Invocation,
        key: Option<JobKey>,
        request: &mut AjaxRequest,
        session: &Session,
        chain: &CustomizerChain,
    ) -> Result<AjaxResult, Failure> {
        if let Some(key) = &key {
            if let Some(running) = queue.contains(key) {
                debug!(
                    parent: &log_context::current_span(),
                    job_id = %running,
                    key = %key,
                    "Equal job already running"
                );
                return Err(already_running(running, session).into());
            }
        }
        if let Some(enqueueable) = invocation.handler.as_enqueueable() {
            enqueueable.prepare_for_enqueue(request, session)?;
        }

        let cancellation = request.cancellation().clone();
        let job_request = request.take_for_job();
        let job_session = session.clone();
        let job_chain = chain.clone();
        let job = Job::new(
            request.module(),
            request.action(),
            session,
            Box::new(move || invocation.run_detached(job_request, job_session, job_chain)),
        )
        .with_key(key);

        match queue.enqueue_and_wait(job, queue.max_request_age(), &cancellation) {
            Ok(result) => Ok(result),
            Err(EnqueueError::Enqueued(info)) => {
                debug!(
                    parent: &log_context::current_span(),
                    module = %request.module(),
                    action = %request.action(),
                    user_id = session.user_id(),
                    context_id = session.context_id(),
                    job_id = %info.id,
                    "Action could not be executed in time; enqueued"
                );
                Ok(AjaxResult::enqueued(info.to_value()))
            }
            Err(EnqueueError::AlreadyRunning(running)) => {
                Err(already_running(running, session).into())
            }
            Err(EnqueueError::Interrupted(id)) => {
                Err(DispatchError::new(ErrorCode::Interrupted)
                    .with_arg(id.to_string())
                    .into())
            }
            Err(EnqueueError::Failed(e)) => Err(e.into()),
        }
    }

    /// Final structured error for a failed dispatch
    fn translate(
        &self,
        failure: Failure,
        request: &AjaxRequest,
        session: &Session,
        chain: &CustomizerChain,
    ) -> DispatchError {
        let error = match failure {
            Failure::Dispatch(error) => error,
            Failure::Unchecked(e) => {
                let query = log_context::sanitized_query_string(request, &self.redactor);
                log_context::put(QUERY_STRING, query.clone());
                error!(
                    parent: &log_context::current_span(),
                    module = %request.module(),
                    action = %request.action(),
                    query = %query,
                    error = %e,
                    "Unexpected error while dispatching request"
                );
                return Failure::Unchecked(e).into_dispatch_error();
            }
        };

        chain.notify_exception(request, session, &error);

        if error.prefix() == SSL_PREFIX
            && self
                .trust
                .as_ref()
                .is_some_and(|t| t.may_define_trust_level(session))
        {
            debug!(
                parent: &log_context::current_span(),
                error_code = %error.code(),
                "Certificate not trusted; user may configure trust"
            );
            return DispatchError::new(ErrorCode::UntrustedCertUserConfig)
                .with_args(error.args().to_vec());
        }

        if has_tls_cause(&error) {
            if let Some(root) = root_dispatch_error(&error) {
                return root;
            }
        }

        if error.category() == crate::error::Category::Error {
            warn!(parent: &log_context::current_span(), error = %error, "Request failed");
        } else {
            debug!(parent: &log_context::current_span(), error = %error, "Request failed");
        }
        error
    }
}

/// Whether this call may go to the job queue, and under which key
fn enqueue_decision(
    handler: &dyn ActionHandler,
    notes: Option<ActionNotes>,
    request: &AjaxRequest,
    session: &Session,
) -> Result<EnqueueDecision, DispatchError> {
    match handler.as_enqueueable() {
        Some(enqueueable) => enqueueable.is_enqueueable(request, session),
        None if notes.is_some_and(|n| n.enqueueable) => Ok(EnqueueDecision::enqueue(None)),
        None => Ok(EnqueueDecision::inline()),
    }
}
