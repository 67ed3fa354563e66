//! Structured logging initialization and configuration
//!
//! Sets up `tracing` output for the dispatcher and its binary:
//! - JSON (production) or pretty (development) formatting
//! - Sampling strategies (all, error-only, sampled); warnings and errors always pass
//! - Optional non-blocking output through `tracing-appender`
//! - A [`Redactor`] that masks credential-like values before they are logged

use anyhow::{Context, Result};
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Level;
use tracing::{Event, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log format: JSON for production, pretty-print for development
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Redaction level for sensitive data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionLevel {
    /// No redaction (dev only)
    None,
    /// Redact credentials (API keys, tokens, passwords, session ids)
    Credentials,
    /// Redact credentials + PII (emails, IPs, user IDs)
    Full,
}

impl RedactionLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => RedactionLevel::None,
            "full" => RedactionLevel::Full,
            _ => RedactionLevel::Credentials,
        }
    }
}

/// Sampling mode: how to decide which logs to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Log everything (high volume)
    All,
    /// Log only WARN and ERROR levels
    ErrorOnly,
    /// Sample INFO and below, log all warnings and errors
    Sampled,
}

impl SamplingMode {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "all" => SamplingMode::All,
            "error-only" | "error_only" => SamplingMode::ErrorOnly,
            _ => SamplingMode::Sampled,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level: trace/debug/info/warn/error
    pub log_level: String,
    /// Log format: json/pretty
    pub format: LogFormat,
    /// Redaction level: none/credentials/full
    pub redact_level: RedactionLevel,
    /// Sampling mode: all/error-only/sampled
    pub sampling_mode: SamplingMode,
    /// Sampling rate (0.0-1.0) for Sampled mode
    pub sampling_rate: f64,
    /// Enable non-blocking buffered output
    pub async_logging: bool,
    /// Lines buffered by the non-blocking writer
    pub buffer_size: usize,
    /// Extra filter directives (comma-separated)
    pub target_filter: Option<String>,
    /// Include file:line location (dev only)
    pub include_location: bool,
}

impl LogConfig {
    /// Parse configuration from `AJAXD_LOG_*` environment variables
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("AJAXD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::parse(
                &env::var("AJAXD_LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            ),
            redact_level: RedactionLevel::parse(
                &env::var("AJAXD_LOG_REDACT_LEVEL").unwrap_or_else(|_| "credentials".to_string()),
            ),
            sampling_mode: SamplingMode::parse(
                &env::var("AJAXD_LOG_SAMPLING_MODE").unwrap_or_else(|_| "all".to_string()),
            ),
            sampling_rate: env::var("AJAXD_LOG_SAMPLING_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.1),
            async_logging: env_bool("AJAXD_LOG_ASYNC", true),
            buffer_size: env::var("AJAXD_LOG_BUFFER_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(8192),
            target_filter: env::var("AJAXD_LOG_TARGET_FILTER").ok(),
            include_location: env_bool("AJAXD_LOG_INCLUDE_LOCATION", false),
        }
    }

    /// Development defaults: everything, pretty, synchronous
    pub fn default_dev() -> Self {
        Self {
            log_level: "debug".to_string(),
            format: LogFormat::Pretty,
            redact_level: RedactionLevel::None,
            sampling_mode: SamplingMode::All,
            sampling_rate: 1.0,
            async_logging: false,
            buffer_size: 1024,
            target_filter: None,
            include_location: true,
        }
    }

    /// Production defaults
    pub fn default_prod() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Json,
            redact_level: RedactionLevel::Credentials,
            sampling_mode: SamplingMode::Sampled,
            sampling_rate: 0.1,
            async_logging: true,
            buffer_size: 8192,
            target_filter: None,
            include_location: false,
        }
    }
}

const CREDENTIAL_PATTERNS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "api_key",
    "apikey",
    "token",
    "authorization",
    "credentials",
    "session",
    "cookie",
];

const PII_PATTERNS: &[&str] = &["email", "mail_address", "ip", "user_id", "phone", "name"];

/// Masks sensitive values by field or parameter name
#[derive(Debug, Clone, Copy)]
pub struct Redactor {
    level: RedactionLevel,
}

impl Redactor {
    pub fn new(level: RedactionLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> RedactionLevel {
        self.level
    }

    /// Check if a value under this name should be redacted
    pub fn should_redact(&self, field_name: &str) -> bool {
        if self.level == RedactionLevel::None {
            return false;
        }
        let name = field_name.to_lowercase();
        if CREDENTIAL_PATTERNS.iter().any(|p| name.contains(p)) {
            return true;
        }
        self.level == RedactionLevel::Full && PII_PATTERNS.iter().any(|p| name.contains(p))
    }

    /// Redacted rendering of `value` (keys and tokens keep their first 4 chars)
    pub fn redact_value(&self, field_name: &str, value: &str) -> String {
        let name = field_name.to_lowercase();
        if value.chars().count() > 4 && (name.contains("key") || name.contains("token")) {
            let prefix: String = value.chars().take(4).collect();
            format!("{prefix}***")
        } else {
            "<REDACTED>".to_string()
        }
    }

    /// `value` as it may be logged
    pub fn apply<'a>(&self, field_name: &str, value: &'a str) -> std::borrow::Cow<'a, str> {
        if self.should_redact(field_name) {
            std::borrow::Cow::Owned(self.redact_value(field_name, value))
        } else {
            std::borrow::Cow::Borrowed(value)
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(RedactionLevel::Credentials)
    }
}

/// Sampling layer: decides whether to emit a log based on sampling rules
pub struct SamplingLayer {
    mode: SamplingMode,
    sampling_rate: f64,
    counter: AtomicU64,
}

impl SamplingLayer {
    pub fn new(mode: SamplingMode, sampling_rate: f64) -> Self {
        Self {
            mode,
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
            counter: AtomicU64::new(0),
        }
    }

    fn should_sample(&self, metadata: &Metadata<'_>) -> bool {
        match self.mode {
            SamplingMode::All => true,
            SamplingMode::ErrorOnly => {
                matches!(metadata.level(), &Level::WARN | &Level::ERROR)
            }
            SamplingMode::Sampled => {
                if matches!(metadata.level(), &Level::WARN | &Level::ERROR) {
                    return true;
                }
                // Spans must stay enabled so request context reaches sampled events
                if metadata.is_span() {
                    return true;
                }
                let count = self.counter.fetch_add(1, Ordering::Relaxed);
                let sample_interval = (1.0 / self.sampling_rate) as u64;
                sample_interval > 0 && count.is_multiple_of(sample_interval)
            }
        }
    }
}

impl<S> Layer<S> for SamplingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: LayerContext<'_, S>) -> bool {
        self.should_sample(metadata)
    }

    fn on_event(&self, _event: &Event<'_>, _ctx: LayerContext<'_, S>) {}
}

/// Keeps the non-blocking writer flushing; drop it at shutdown
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

/// Initialize logging with the given configuration.
///
/// ```no_run
/// use ajaxdispatch::otel::{init_logging_with_config, LogConfig};
///
/// let _guard = init_logging_with_config(&LogConfig::from_env())
///     .expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_config(config: &LogConfig) -> Result<LoggingGuard> {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if let Some(target_filter) = &config.target_filter {
        for filter in target_filter.split(',') {
            let filter = filter.trim();
            if filter.is_empty() {
                continue;
            }
            match filter.parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(_) => eprintln!("Warning: Invalid log filter directive: {filter}"),
            }
        }
    }

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(SamplingLayer::new(config.sampling_mode, config.sampling_rate));

    let (writer, worker) = if config.async_logging {
        let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
            .buffered_lines_limit(config.buffer_size)
            .finish(std::io::stdout());
        (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(non_blocking),
            Some(guard),
        )
    } else {
        (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stdout),
            None,
        )
    };

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_list(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_writer(writer)
            .boxed(),
    };

    registry
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LoggingGuard { _worker: worker })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default_dev() {
        let config = LogConfig::default_dev();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.redact_level, RedactionLevel::None);
        assert_eq!(config.sampling_mode, SamplingMode::All);
        assert!(!config.async_logging);
        assert!(config.include_location);
    }

    #[test]
    fn test_log_config_default_prod() {
        let config = LogConfig::default_prod();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.redact_level, RedactionLevel::Credentials);
        assert_eq!(config.sampling_mode, SamplingMode::Sampled);
        assert!(config.async_logging);
    }

    #[test]
    fn test_parsers() {
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
        assert_eq!(RedactionLevel::parse("none"), RedactionLevel::None);
        assert_eq!(RedactionLevel::parse("full"), RedactionLevel::Full);
        assert_eq!(RedactionLevel::parse("invalid"), RedactionLevel::Credentials);
        assert_eq!(SamplingMode::parse("error_only"), SamplingMode::ErrorOnly);
        assert_eq!(SamplingMode::parse("invalid"), SamplingMode::Sampled);
    }

    #[test]
    fn test_redactor_credentials() {
        let redactor = Redactor::new(RedactionLevel::Credentials);
        assert!(redactor.should_redact("password"));
        assert!(redactor.should_redact("oauth_token"));
        assert!(redactor.should_redact("session"));
        assert!(!redactor.should_redact("folder"));
        assert!(!redactor.should_redact("email"));

        assert_eq!(redactor.apply("folder", "INBOX"), "INBOX");
        assert_eq!(redactor.apply("api_key", "test1234567890"), "test***");
        assert_eq!(redactor.apply("password", "secret123"), "<REDACTED>");
    }

    #[test]
    fn test_redactor_levels() {
        assert!(Redactor::new(RedactionLevel::Full).should_redact("email"));
        assert!(!Redactor::new(RedactionLevel::None).should_redact("password"));
    }

    fn metadata(level: Level) -> tracing::Metadata<'static> {
        tracing::Metadata::new(
            "test",
            "test::module",
            level,
            None,
            None,
            None,
            tracing::field::FieldSet::new(&[], tracing::callsite::Identifier(&CALLSITE)),
            tracing::metadata::Kind::EVENT,
        )
    }

    #[test]
    fn test_sampling_error_only() {
        let layer = SamplingLayer::new(SamplingMode::ErrorOnly, 1.0);
        assert!(!layer.should_sample(&metadata(Level::INFO)));
        assert!(layer.should_sample(&metadata(Level::WARN)));
        assert!(layer.should_sample(&metadata(Level::ERROR)));
    }

    #[test]
    fn test_sampling_respects_rate() {
        let layer = SamplingLayer::new(SamplingMode::Sampled, 0.5);
        let info = metadata(Level::INFO);
        let sampled = (0..100).filter(|_| layer.should_sample(&info)).count();
        assert_eq!(sampled, 50);
        let error = metadata(Level::ERROR);
        assert!((0..10).all(|_| layer.should_sample(&error)));
    }

    #[test]
    fn test_sampling_rate_clamping() {
        assert_eq!(SamplingLayer::new(SamplingMode::Sampled, -0.5).sampling_rate, 0.0);
        assert_eq!(SamplingLayer::new(SamplingMode::Sampled, 1.5).sampling_rate, 1.0);
    }

    struct TestCallsite;
    impl tracing::callsite::Callsite for TestCallsite {
        fn set_interest(&self, _interest: tracing::subscriber::Interest) {}
        fn metadata(&self) -> &tracing::Metadata<'_> {
            unimplemented!("not used in tests")
        }
    }
    static CALLSITE: TestCallsite = TestCallsite;
}
