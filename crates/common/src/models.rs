//! Common data models for the inference dispatcher
//!
//! Node health and metrics bookkeeping, and the resource snapshot produced
//! by the resource manager.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Node is fully healthy
    Healthy,
    /// Node is usable but impaired
    Degraded,
    /// Node must not receive work
    Unhealthy,
}

impl HealthStatus {
    /// Maps a health score to a status
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => HealthStatus::Healthy,
            50..=79 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    /// Returns true if nodes with this status may be selected for routing
    pub fn is_eligible(self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Node health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Health status
    pub status: HealthStatus,
    /// Health score (0-100)
    pub score: u8,
    /// Issue tags found by the last check
    pub issues: Vec<String>,
    /// Time of the last check
    pub last_check: Option<DateTime<Utc>>,
}

impl NodeHealth {
    /// Health of a freshly registered node
    pub fn full() -> Self {
        Self {
            status: HealthStatus::Healthy,
            score: 100,
            issues: Vec::new(),
            last_check: None,
        }
    }

    /// Health of a node whose check could not complete
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            score: 0,
            issues: vec![reason.into()],
            last_check: Some(Utc::now()),
        }
    }
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self::full()
    }
}

/// Node metrics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Requests per second observed between the last two health checks
    pub requests_per_second: f64,
    /// Mean latency over the latency window, in milliseconds
    pub average_latency_ms: f64,
    /// Error rate (0.0-1.0)
    pub error_rate: f64,
    /// CPU utilization (0.0-1.0)
    pub cpu_utilization: f64,
    /// Memory utilization (0.0-1.0)
    pub memory_utilization: f64,
    /// Work accepted by the pool but not yet started
    pub queue_depth: u64,
    /// Requests routed to the node and still in flight
    pub active_connections: u64,
}

/// Point-in-time view of system resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Total memory in bytes
    pub total_memory_bytes: u64,
    /// Available memory in bytes
    pub available_memory_bytes: u64,
    /// CPU utilization (0.0-1.0)
    pub cpu_utilization: f64,
    /// Sample time
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Creates a snapshot, clamping available memory and CPU into range
    pub fn new(total_memory_bytes: u64, available_memory_bytes: u64, cpu_utilization: f64) -> Self {
        Self {
            total_memory_bytes,
            available_memory_bytes: available_memory_bytes.min(total_memory_bytes),
            cpu_utilization: cpu_utilization.clamp(0.0, 1.0),
            sampled_at: Utc::now(),
        }
    }

    /// Memory utilization (0.0-1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 0.0;
        }
        let used = self
            .total_memory_bytes
            .saturating_sub(self.available_memory_bytes);
        used as f64 / self.total_memory_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_score() {
        assert_eq!(HealthStatus::from_score(100), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(80), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(79), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(50), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(49), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_score(0), HealthStatus::Unhealthy);
        assert!(HealthStatus::Degraded.is_eligible());
        assert!(!HealthStatus::Unhealthy.is_eligible());
    }

    #[test]
    fn test_snapshot_memory_utilization() {
        let snapshot = ResourceSnapshot::new(1000, 250, 1.7);

        assert!((snapshot.memory_utilization() - 0.75).abs() < f64::EPSILON);
        assert_eq!(snapshot.cpu_utilization, 1.0);
    }

    #[test]
    fn test_overreported_available_memory_counts_as_idle() {
        let snapshot = ResourceSnapshot {
            available_memory_bytes: 2000,
            ..ResourceSnapshot::new(1000, 0, 0.0)
        };

        assert_eq!(snapshot.memory_utilization(), 0.0);
        assert_eq!(ResourceSnapshot::new(0, 0, 0.0).memory_utilization(), 0.0);
    }
}
