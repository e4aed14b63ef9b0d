//! Balancer events
//!
//! Observers subscribe through [`crate::LoadBalancer::subscribe`] and receive
//! every event published after subscribing. Slow subscribers lose the oldest
//! events rather than slowing routing down.

use serde::{Deserialize, Serialize};

use common::models::HealthStatus;
use common::types::Strategy;

/// Event published by the load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BalancerEvent {
    /// A node was registered
    NodeAdded {
        /// Node identifier
        node_id: String,
        /// Routing weight
        weight: f64,
    },

    /// A node was removed from the registry
    NodeRemoved {
        /// Node identifier
        node_id: String,
    },

    /// A health check changed a node's status
    HealthChanged {
        /// Node identifier
        node_id: String,
        /// Previous status
        from: HealthStatus,
        /// New status
        to: HealthStatus,
        /// New health score
        score: u8,
    },

    /// The active strategy was replaced
    StrategyChanged {
        /// Previous strategy
        from: Strategy,
        /// New strategy
        to: Strategy,
    },

    /// A work item completed on a node
    RequestCompleted {
        /// Node identifier
        node_id: String,
        /// Work item identifier
        item_id: String,
        /// Observed latency in milliseconds
        latency_ms: f64,
    },

    /// A work item failed on a node
    RequestFailed {
        /// Node identifier
        node_id: String,
        /// Work item identifier
        item_id: String,
        /// Failure description
        error: String,
    },
}
