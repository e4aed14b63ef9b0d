//! Dispatch metrics collection for the inference dispatcher
//!
//! This crate provides functionality for counting dispatch outcomes and
//! tracking request latency percentiles. Every observation is also reported
//! through the `metrics` facade, so any installed recorder picks it up.

pub mod collector;

// Re-export commonly used types
pub use collector::{MetricsCollector, MetricsSnapshot};
