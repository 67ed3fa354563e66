//! Synthetic workload for the `simulate` command

use crate::dispatcher::Dispatcher;
use crate::error::{ActionError, DispatchError};
use crate::handler::{ActionFactory, ActionHandler, ActionNotes, ActionOutcome};
use crate::job_queue::InProcessJobQueue;
use crate::request::{AjaxRequest, PARAMETER_ALLOW_ENQUEUE};
use crate::result::{AjaxResult, ResultKind};
use crate::runtime_config::{DispatcherConfig, JobQueueConfig};
use crate::session::Session;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const DEMO_MODULE: &str = "demo";

/// Parameters of one simulation run
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub threads: usize,
    pub requests_per_thread: usize,
    /// Send `allow_enqueue=true` with every request
    pub enqueue: bool,
    /// Sleep of the slow action
    pub work: Duration,
    pub dispatcher: DispatcherConfig,
    pub job_queue: JobQueueConfig,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub requests: u64,
    pub failures: u64,
    pub enqueued: u64,
    pub elapsed: Duration,
    /// Prometheus exposition of the dispatcher metrics
    pub metrics: String,
}

struct Echo;

impl ActionHandler for Echo {
    fn perform(
        &self,
        request: &mut AjaxRequest,
        session: &Session,
    ) -> Result<ActionOutcome, ActionError> {
        Ok(AjaxResult::new(json!({
            "user": session.user_id(),
            "seq": request.parameter("seq"),
        }))
        .into())
    }
}

struct Slow {
    work: Duration,
}

impl ActionHandler for Slow {
    fn perform(&self, _: &mut AjaxRequest, _: &Session) -> Result<ActionOutcome, ActionError> {
        may::coroutine::sleep(self.work);
        Ok(AjaxResult::new(json!({ "slept_ms": self.work.as_millis() as u64 })).into())
    }

    fn notes(&self) -> Option<ActionNotes> {
        Some(ActionNotes::default().enqueueable())
    }
}

struct DemoFactory {
    echo: Arc<dyn ActionHandler>,
    slow: Arc<dyn ActionHandler>,
}

impl ActionFactory for DemoFactory {
    fn create_action(&self, action: &str) -> Result<Option<Arc<dyn ActionHandler>>, DispatchError> {
        Ok(match action {
            "echo" => Some(Arc::clone(&self.echo)),
            "slow" => Some(Arc::clone(&self.slow)),
            _ => None,
        })
    }
}

/// Action for the `n`-th request: mostly echo, every fourth slow,
/// every tenth unknown
fn action_for(n: usize) -> &'static str {
    if n % 10 == 9 {
        "missing"
    } else if n % 4 == 0 {
        "slow"
    } else {
        "echo"
    }
}

pub fn run_simulation(settings: &SimulationSettings) -> anyhow::Result<SimulationReport> {
    let mut dispatcher = Dispatcher::new(settings.dispatcher.clone());
    if settings.enqueue {
        // SAFETY: the may runtime is configured with defaults before any
        // coroutine is spawned; the queue lives until the process exits
        let queue = unsafe { InProcessJobQueue::new(settings.job_queue.clone()) };
        dispatcher = dispatcher.with_job_queue(Arc::new(queue));
    }
    dispatcher.register(
        DEMO_MODULE,
        Arc::new(DemoFactory {
            echo: Arc::new(Echo),
            slow: Arc::new(Slow {
                work: settings.work,
            }),
        }),
    );
    let dispatcher = Arc::new(dispatcher);

    let failures = Arc::new(AtomicU64::new(0));
    let enqueued = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..settings.threads)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            let failures = Arc::clone(&failures);
            let enqueued = Arc::clone(&enqueued);
            let requests = settings.requests_per_thread;
            let allow_enqueue = settings.enqueue;
            thread::Builder::new()
                .name(format!("simulate-{t}"))
                .spawn(move || {
                    let session = Session::new(format!("sim-{t}"), t as i32 + 1, 1);
                    for n in 0..requests {
                        let mut request = AjaxRequest::new(DEMO_MODULE, action_for(n))
                            .with_parameter("seq", n.to_string());
                        if allow_enqueue {
                            request = request.with_parameter(PARAMETER_ALLOW_ENQUEUE, "true");
                        }
                        match dispatcher.perform(request, Some(&session)) {
                            Ok(result) if result.kind() == ResultKind::Enqueued => {
                                enqueued.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!(thread = t, seq = n, error = %e, "Simulated request failed");
                                failures.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
        })
        .collect::<Result<_, _>>()?;

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("simulation thread panicked"))?;
    }

    Ok(SimulationReport {
        requests: (settings.threads * settings.requests_per_thread) as u64,
        failures: failures.load(Ordering::Relaxed),
        enqueued: enqueued.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
        metrics: dispatcher.metrics().render_prometheus(),
    })
}
