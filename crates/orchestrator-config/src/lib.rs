//! Configuration management for the inference dispatcher
//!
//! This crate provides functionality for loading and validating the
//! dispatcher configuration from defaults, files and the environment.

pub mod manager;
pub mod settings;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use settings::{
    AdaptiveSettings, CacheSettings, DispatchSettings, LoadBalancerSettings, LoggingSettings,
    QueueSettings, ResourceSettings, ScalerSettings, MAX_LATENCY_WINDOW,
};
