use super::simulate::{run_simulation, SimulationSettings};
use crate::otel::{init_logging_with_config, LogConfig};
use crate::runtime_config::{DispatcherConfig, JobQueueConfig};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::info;

/// Command-line interface for ajaxdispatch
#[derive(Parser)]
#[command(name = "ajaxdispatch")]
#[command(about = "AJAX dispatch pipeline CLI", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a synthetic workload through the dispatcher and print metrics
    Simulate {
        /// Number of concurrent request threads
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// Requests sent by each thread
        #[arg(short, long, default_value_t = 1000)]
        requests: usize,

        /// Allow slow actions to go through the job queue
        #[arg(long, default_value_t = false)]
        enqueue: bool,

        /// Simulated work of the slow action in milliseconds
        #[arg(long, default_value_t = 5)]
        work_ms: u64,
    },
}

pub fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging = init_logging_with_config(&LogConfig::from_env())?;
    match cli.command {
        Commands::Simulate {
            threads,
            requests,
            enqueue,
            work_ms,
        } => {
            let settings = SimulationSettings {
                threads: threads.max(1),
                requests_per_thread: requests,
                enqueue,
                work: Duration::from_millis(work_ms),
                dispatcher: DispatcherConfig::from_env(),
                job_queue: JobQueueConfig::from_env(),
            };
            let report = run_simulation(&settings)?;
            info!(
                requests = report.requests,
                failures = report.failures,
                enqueued = report.enqueued,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Simulation finished"
            );
            print!("{}", report.metrics);
            Ok(())
        }
    }
}
