//! # Metrics Module
//!
//! Per-call request metrics, keyed by module, action and status.
//!
//! The dispatcher records every call exactly once. Calls that fail before
//! the action is resolved are recorded under [`UNKNOWN`]. The status label is
//! [`STATUS_OK`] for successful calls and the error category otherwise.
//!
//! Aggregates are kept in a [`DashMap`] of atomic counters so that recording
//! never takes a global lock, and can be rendered in Prometheus text format.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Placeholder for module/action before they are resolved
pub const UNKNOWN: &str = "UNKNOWN";

/// Status label of successful calls
pub const STATUS_OK: &str = "OK";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub module: String,
    pub action: String,
    pub status: String,
}

#[derive(Debug, Default)]
struct Aggregate {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

/// Point-in-time copy of one aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSample {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl MetricSample {
    /// Mean duration in milliseconds
    #[must_use]
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// Request metrics of one dispatcher
#[derive(Debug, Default)]
pub struct RequestMetrics {
    entries: DashMap<MetricKey, Aggregate>,
}

impl RequestMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call
    pub fn record(&self, module: &str, action: &str, status: &str, duration: Duration) {
        let key = MetricKey {
            module: module.to_string(),
            action: action.to_string(),
            status: status.to_string(),
        };
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let entry = self.entries.entry(key).or_default();
        entry.count.fetch_add(1, Ordering::Relaxed);
        entry.total_ms.fetch_add(ms, Ordering::Relaxed);
        entry.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Sample for one key
    #[must_use]
    pub fn get(&self, module: &str, action: &str, status: &str) -> Option<MetricSample> {
        let key = MetricKey {
            module: module.to_string(),
            action: action.to_string(),
            status: status.to_string(),
        };
        self.entries.get(&key).map(|a| sample(&a))
    }

    /// All samples, sorted by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<(MetricKey, MetricSample)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), sample(e.value())))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Total number of recorded calls
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.value().count.load(Ordering::Relaxed))
            .sum()
    }

    /// Prometheus text exposition
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let samples = self.snapshot();
        let mut output = String::with_capacity(256 + samples.len() * 192);

        output.push_str("# HELP ajax_requests_total Total number of dispatched requests\n");
        output.push_str("# TYPE ajax_requests_total counter\n");
        for (key, s) in &samples {
            output.push_str(&format!("ajax_requests_total{{{}}} {}\n", labels(key), s.count));
        }

        output.push_str("# HELP ajax_request_duration_ms_sum Total request duration in milliseconds\n");
        output.push_str("# TYPE ajax_request_duration_ms_sum counter\n");
        for (key, s) in &samples {
            output.push_str(&format!("ajax_request_duration_ms_sum{{{}}} {}\n", labels(key), s.total_ms));
        }

        output.push_str("# HELP ajax_request_duration_ms_max Slowest request in milliseconds\n");
        output.push_str("# TYPE ajax_request_duration_ms_max gauge\n");
        for (key, s) in &samples {
            output.push_str(&format!("ajax_request_duration_ms_max{{{}}} {}\n", labels(key), s.max_ms));
        }
        output
    }
}

fn sample(a: &Aggregate) -> MetricSample {
    MetricSample {
        count: a.count.load(Ordering::Relaxed),
        total_ms: a.total_ms.load(Ordering::Relaxed),
        max_ms: a.max_ms.load(Ordering::Relaxed),
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn labels(key: &MetricKey) -> String {
    format!(
        "module=\"{}\",action=\"{}\",status=\"{}\"",
        escape(&key.module),
        escape(&key.action),
        escape(&key.status)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_aggregates() {
        let metrics = RequestMetrics::new();
        metrics.record("mail", "get", STATUS_OK, Duration::from_millis(10));
        metrics.record("mail", "get", STATUS_OK, Duration::from_millis(30));
        metrics.record(UNKNOWN, UNKNOWN, "USER_INPUT", Duration::from_millis(1));

        let s = metrics.get("mail", "get", STATUS_OK).unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.total_ms, 40);
        assert_eq!(s.max_ms, 30);
        assert!((s.average_ms() - 20.0).abs() < f64::EPSILON);
        assert_eq!(metrics.total_count(), 3);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = RequestMetrics::new();
        metrics.record("mail", "get", STATUS_OK, Duration::from_millis(5));
        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE ajax_requests_total counter"));
        assert!(text.contains("ajax_requests_total{module=\"mail\",action=\"get\",status=\"OK\"} 1"));
        assert!(text.contains("ajax_request_duration_ms_max{module=\"mail\",action=\"get\",status=\"OK\"} 5"));
    }

    #[test]
    fn test_label_escaping() {
        let key = MetricKey {
            module: "a\"b".into(),
            action: "x".into(),
            status: STATUS_OK.into(),
        };
        assert_eq!(labels(&key), "module=\"a\\\"b\",action=\"x\",status=\"OK\"");
    }
}
