//! # CLI Module
//!
//! Command-line front end of the `ajaxdispatch` binary.
//!
//! ## Commands
//!
//! ### `simulate`
//!
//! Drive a synthetic workload through a [`Dispatcher`](crate::Dispatcher) with
//! demo handlers and print the resulting metrics in Prometheus text format:
//!
//! ```bash
//! ajaxdispatch simulate --threads 8 --requests 500
//! ```
//!
//! Options:
//! - `--threads <N>` - Concurrent request threads (default: 4)
//! - `--requests <N>` - Requests per thread (default: 1000)
//! - `--enqueue` - Send `allow_enqueue=true` so slow actions go through the job queue
//! - `--work-ms <MS>` - Simulated work of the slow action (default: 5)
//!
//! Job queue sizing and logging follow the `AJAXD_*` environment variables.
//!
//! ## Usage from Code
//!
//! ```rust,ignore
//! use ajaxdispatch::cli::run_cli;
//!
//! run_cli()?;
//! ```

mod commands;
mod simulate;


pub use commands::{run_cli, Cli, Commands};
pub use simulate::{run_simulation, SimulationReport, SimulationSettings};
