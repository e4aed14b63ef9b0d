//! Metrics collector implementation
//!
//! Counters are kept locally so a snapshot can be taken without a metrics
//! recorder installed; latencies go into an HDR histogram in microseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdrhistogram::Histogram;
use metrics::{gauge, histogram, increment_counter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::error::{Error, Result};
use common::types::Priority;

/// Significant decimal digits kept by the latency histogram
const HISTOGRAM_PRECISION: u8 = 3;

/// Longest tracked latency (one hour, in microseconds); longer ones are clamped
const MAX_TRACKED_MICROS: u64 = 3_600_000_000;

/// Point-in-time summary of collected metrics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Work items accepted by the queue
    pub submitted: u64,

    /// Work items rejected because the queue was full
    pub rejected: u64,

    /// Work items completed successfully
    pub completed: u64,

    /// Work items that failed after exhausting their retries
    pub failed: u64,

    /// Resubmissions within a retry budget
    pub retried: u64,

    /// Attempts that exceeded their timeout
    pub timeouts: u64,

    /// Work items cancelled before dispatch
    pub cancelled: u64,

    /// Results served from the request cache
    pub cache_hits: u64,

    /// Cache lookups that missed
    pub cache_misses: u64,

    /// Median latency in milliseconds
    pub latency_p50_ms: f64,

    /// 95th percentile latency in milliseconds
    pub latency_p95_ms: f64,

    /// 99th percentile latency in milliseconds
    pub latency_p99_ms: f64,

    /// Maximum latency in milliseconds
    pub latency_max_ms: f64,

    /// Mean latency in milliseconds
    pub latency_mean_ms: f64,
}

impl MetricsSnapshot {
    /// Fraction of cache lookups that hit
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64
    }
}

/// Collector of dispatch metrics
pub struct MetricsCollector {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    /// Completed request latencies in microseconds
    latency: Mutex<Histogram<u64>>,
}

impl MetricsCollector {
    /// Creates a new collector
    pub fn new() -> Result<Self> {
        let latency = Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, HISTOGRAM_PRECISION)
            .map_err(|e| Error::Internal(format!("Failed to create latency histogram: {}", e)))?;

        Ok(Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            latency: Mutex::new(latency),
        })
    }

    /// Records an accepted work item
    pub fn record_submitted(&self, priority: Priority) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_submitted_total", "priority" => priority.to_string());
    }

    /// Records a work item rejected by a full queue
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_rejected_total");
    }

    /// Records a completed work item and its end-to-end latency
    pub fn record_completed(&self, latency: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_completed_total");
        histogram!("dispatch_request_duration_seconds", latency.as_secs_f64());

        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency.lock().saturating_record(micros.max(1));
    }

    /// Records a work item that failed for good
    pub fn record_failed(&self, error: &Error) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_failed_total", "kind" => error_kind(error));
        debug!("Recorded failed work item: {}", error);
    }

    /// Records a resubmission
    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_retried_total");
    }

    /// Records an attempt that exceeded its timeout
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_timed_out_total");
    }

    /// Records a work item cancelled before dispatch
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dispatch_requests_cancelled_total");
    }

    /// Records a cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            increment_counter!("dispatch_cache_hits_total");
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            increment_counter!("dispatch_cache_misses_total");
        }
    }

    /// Reports the number of queued work items
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!("dispatch_queue_depth", depth as f64);
    }

    /// Reports the number of registered nodes
    pub fn set_node_count(&self, nodes: usize) {
        gauge!("dispatch_nodes", nodes as f64);
    }

    /// Takes a snapshot of the collected metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, max, mean) = {
            let latency = self.latency.lock();
            if latency.is_empty() {
                (0.0, 0.0, 0.0, 0.0, 0.0)
            } else {
                (
                    micros_to_ms(latency.value_at_quantile(0.5) as f64),
                    micros_to_ms(latency.value_at_quantile(0.95) as f64),
                    micros_to_ms(latency.value_at_quantile(0.99) as f64),
                    micros_to_ms(latency.max() as f64),
                    micros_to_ms(latency.mean()),
                )
            }
        };

        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            latency_max_ms: max,
            latency_mean_ms: mean,
        }
    }
}

fn micros_to_ms(micros: f64) -> f64 {
    micros / 1000.0
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::NoHealthyNodes => "no_healthy_nodes",
        Error::RequestExecution { .. } => "execution",
        Error::Timeout(_) => "timeout",
        Error::Cancelled(_) => "cancelled",
        Error::QueueFull(_) => "queue_full",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_submitted(Priority::High);
        collector.record_submitted(Priority::Low);
        collector.record_retry();
        collector.record_failed(&Error::NoHealthyNodes);
        collector.record_timeout();
        collector.record_cancelled();
        collector.record_rejected();
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(false);
        collector.record_cache_lookup(false);
        collector.set_queue_depth(3);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.rejected, 1);
        assert!((snapshot.cache_hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_percentiles() {
        let collector = MetricsCollector::new().unwrap();
        assert_eq!(collector.snapshot().latency_p99_ms, 0.0);

        for ms in 1..=100 {
            collector.record_completed(Duration::from_millis(ms));
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.completed, 100);
        assert!((snapshot.latency_p50_ms - 50.0).abs() < 0.1);
        assert!((snapshot.latency_p99_ms - 99.0).abs() < 0.1);
        assert!((snapshot.latency_max_ms - 100.0).abs() < 0.1);
        assert!((snapshot.latency_mean_ms - 50.5).abs() < 0.1);
    }

    #[test]
    fn test_long_latencies_keep_their_magnitude() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_completed(Duration::from_secs(30));
        assert!((collector.snapshot().latency_max_ms - 30_000.0).abs() < 30.0);

        collector.record_completed(Duration::from_secs(2 * 3600));
        let max = collector.snapshot().latency_max_ms;
        assert!((max - 3_600_000.0).abs() < 3_600.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_completed(Duration::from_millis(5));

        let value = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(value["completed"], 1);
    }
}
