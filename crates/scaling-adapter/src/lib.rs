//! Load balancing, adaptive strategy selection and dynamic scaling
//!
//! This crate provides the routing core of the dispatcher: a health-aware
//! [`LoadBalancer`] over a registry of worker-pool nodes, an
//! [`AdaptiveLoadBalancer`] that swaps strategies based on observed
//! performance, and a [`DynamicScaler`] that grows and shrinks the node set.

pub mod adaptive;
pub mod balancer;
pub mod events;
pub mod health;
pub mod node;
pub mod router;
pub mod scaler;
pub mod stats;
pub mod strategy;

// Re-export commonly used types
pub use adaptive::{performance_score, AdaptiveLoadBalancer, PerformanceWindow};
pub use balancer::LoadBalancer;
pub use events::BalancerEvent;
pub use health::compute_health;
pub use node::{LatencyHistory, Node};
pub use router::RequestRouter;
pub use scaler::{
    BacklogSource, DynamicScaler, LoadSignals, NodeProvisioner, ProvisionedNode, ScalingDecision,
    ScalingEvent,
};
pub use stats::{BalancerStats, NodeStats};
pub use strategy::Candidate;
