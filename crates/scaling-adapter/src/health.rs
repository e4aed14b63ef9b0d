//! Node health scoring
//!
//! A node starts every check at 100 and loses points for each metric past
//! its threshold. The resulting score maps to a [`HealthStatus`].

use chrono::Utc;

use common::models::{HealthStatus, NodeHealth, NodeMetrics};

/// Error rate above which a node is penalized
pub const ERROR_RATE_THRESHOLD: f64 = 0.1;

/// Mean latency above which a node is penalized, in milliseconds
pub const LATENCY_THRESHOLD_MS: f64 = 5_000.0;

/// CPU utilization above which a node is penalized
pub const CPU_THRESHOLD: f64 = 0.9;

/// Memory utilization above which a node is penalized
pub const MEMORY_THRESHOLD: f64 = 0.9;

/// Queue depth above which a node is penalized
pub const QUEUE_DEPTH_THRESHOLD: u64 = 100;

const ERROR_RATE_PENALTY: i32 = 30;
const LATENCY_PENALTY: i32 = 25;
const CPU_PENALTY: i32 = 20;
const MEMORY_PENALTY: i32 = 20;
const QUEUE_DEPTH_PENALTY: i32 = 15;

/// Scores a node from its current metrics
pub fn compute_health(metrics: &NodeMetrics) -> NodeHealth {
    let mut score: i32 = 100;
    let mut issues = Vec::new();

    let mut penalize = |condition: bool, penalty: i32, issue: &str| {
        if condition {
            score -= penalty;
            issues.push(issue.to_string());
        }
    };

    penalize(
        metrics.error_rate > ERROR_RATE_THRESHOLD,
        ERROR_RATE_PENALTY,
        "high error rate",
    );
    penalize(
        metrics.average_latency_ms > LATENCY_THRESHOLD_MS,
        LATENCY_PENALTY,
        "high latency",
    );
    penalize(
        metrics.cpu_utilization > CPU_THRESHOLD,
        CPU_PENALTY,
        "high cpu utilization",
    );
    penalize(
        metrics.memory_utilization > MEMORY_THRESHOLD,
        MEMORY_PENALTY,
        "high memory utilization",
    );
    penalize(
        metrics.queue_depth > QUEUE_DEPTH_THRESHOLD,
        QUEUE_DEPTH_PENALTY,
        "high queue depth",
    );

    let score = score.clamp(0, 100) as u8;

    NodeHealth {
        status: HealthStatus::from_score(score),
        score,
        issues,
        last_check: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_metrics_are_healthy() {
        let health = compute_health(&NodeMetrics::default());

        assert_eq!(health.score, 100);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
        assert!(health.last_check.is_some());
    }

    #[test]
    fn test_error_rate_alone_degrades() {
        let health = compute_health(&NodeMetrics {
            error_rate: 0.12,
            ..Default::default()
        });

        assert_eq!(health.score, 70);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.status.is_eligible());
        assert_eq!(health.issues, vec!["high error rate".to_string()]);
    }

    #[test]
    fn test_errors_and_latency_make_unhealthy() {
        let health = compute_health(&NodeMetrics {
            error_rate: 0.15,
            average_latency_ms: 6_000.0,
            ..Default::default()
        });

        assert_eq!(health.score, 45);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.status.is_eligible());
    }

    #[test]
    fn test_score_is_clamped_at_zero() {
        let health = compute_health(&NodeMetrics {
            error_rate: 1.0,
            average_latency_ms: 60_000.0,
            cpu_utilization: 1.0,
            memory_utilization: 1.0,
            queue_depth: 1_000,
            ..Default::default()
        });

        assert_eq!(health.score, 0);
        assert_eq!(health.issues.len(), 5);
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let health = compute_health(&NodeMetrics {
            error_rate: 0.1,
            average_latency_ms: 5_000.0,
            cpu_utilization: 0.9,
            memory_utilization: 0.9,
            queue_depth: 100,
            ..Default::default()
        });

        assert_eq!(health.score, 100);
    }
}
