//! Balancer statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::models::HealthStatus;
use common::types::Strategy;

/// Per-node statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Node identifier
    pub id: String,

    /// Routing weight
    pub weight: f64,

    /// Health status
    pub status: HealthStatus,

    /// Health score (0-100)
    pub health_score: u8,

    /// Issues found by the last health check
    pub issues: Vec<String>,

    /// Requests routed to the node
    pub total_requests: u64,

    /// Requests that failed on the node
    pub failed_requests: u64,

    /// Requests in flight
    pub active_connections: u64,

    /// Mean latency over the latency window, in milliseconds
    pub average_latency_ms: f64,

    /// Number of samples in the latency window
    pub latency_samples: usize,

    /// Error rate (0.0-1.0)
    pub error_rate: f64,

    /// Requests per second between the last two health checks
    pub requests_per_second: f64,

    /// CPU utilization (0.0-1.0)
    pub cpu_utilization: f64,

    /// Memory utilization (0.0-1.0)
    pub memory_utilization: f64,

    /// Work waiting in the node's pool
    pub queue_depth: u64,

    /// Time of the last health check
    pub last_check: Option<DateTime<Utc>>,
}

/// Aggregate balancer statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerStats {
    /// Registered nodes
    pub total_nodes: usize,

    /// Nodes eligible for routing
    pub healthy_nodes: usize,

    /// Requests routed across all nodes
    pub total_requests: u64,

    /// Mean latency across all latency windows, in milliseconds
    pub average_latency: f64,

    /// Failed requests across all nodes
    pub total_errors: u64,

    /// Error rate across all nodes (0.0-1.0)
    pub error_rate: f64,

    /// Active strategy
    pub strategy: Strategy,

    /// Per-node breakdown, in registration order
    pub per_node_stats: Vec<NodeStats>,
}

impl BalancerStats {
    /// Aggregates per-node statistics
    pub fn from_nodes(strategy: Strategy, per_node_stats: Vec<NodeStats>) -> Self {
        let total_requests: u64 = per_node_stats.iter().map(|n| n.total_requests).sum();
        let total_errors: u64 = per_node_stats.iter().map(|n| n.failed_requests).sum();
        let samples: usize = per_node_stats.iter().map(|n| n.latency_samples).sum();

        let average_latency = if samples == 0 {
            0.0
        } else {
            per_node_stats
                .iter()
                .map(|n| n.average_latency_ms * n.latency_samples as f64)
                .sum::<f64>()
                / samples as f64
        };

        let error_rate = if total_requests == 0 {
            0.0
        } else {
            total_errors as f64 / total_requests as f64
        };

        Self {
            total_nodes: per_node_stats.len(),
            healthy_nodes: per_node_stats
                .iter()
                .filter(|n| n.status.is_eligible())
                .count(),
            total_requests,
            average_latency,
            total_errors,
            error_rate,
            strategy,
            per_node_stats,
        }
    }

    /// Requests currently in flight across all nodes
    pub fn active_connections(&self) -> u64 {
        self.per_node_stats.iter().map(|n| n.active_connections).sum()
    }

    /// Gets the statistics of one node
    pub fn node(&self, id: &str) -> Option<&NodeStats> {
        self.per_node_stats.iter().find(|n| n.id == id)
    }
}
