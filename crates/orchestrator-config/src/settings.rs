//! Typed configuration sections
//!
//! Every field carries a serde default, so a configuration source only needs
//! to mention the values it overrides. Intervals are expressed in
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::types::Strategy;

/// Upper bound of the per-node latency window
pub const MAX_LATENCY_WINDOW: usize = 100;

/// Root configuration of the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Load balancer settings
    pub load_balancer: LoadBalancerSettings,
    /// Adaptive strategy selection settings
    pub adaptive: AdaptiveSettings,
    /// Dynamic scaler settings
    pub scaler: ScalerSettings,
    /// Queue manager settings
    pub queue: QueueSettings,
    /// Request cache settings
    pub cache: CacheSettings,
    /// Resource sampling settings
    pub resources: ResourceSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl DispatchSettings {
    /// Validates cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.load_balancer.validate()?;
        self.adaptive.validate()?;
        self.scaler.validate()?;
        self.queue.validate()?;
        self.cache.validate()?;
        self.resources.validate()?;
        Ok(())
    }
}

fn require_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{} must be greater than 0", name)));
    }
    Ok(())
}

fn require_fraction(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::Config(format!(
            "{} must be between 0 and 1, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Load balancer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerSettings {
    /// Initial selection strategy
    pub strategy: Strategy,
    /// Whether the periodic health check runs
    pub health_checks_enabled: bool,
    /// Interval between health check passes
    pub health_check_interval_ms: u64,
    /// Upper bound for a single node probe
    pub health_check_timeout_ms: u64,
    /// Capacity of the latency window kept per node
    pub latency_window: usize,
    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            health_checks_enabled: true,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            latency_window: 100,
            event_channel_capacity: 256,
        }
    }
}

impl LoadBalancerSettings {
    /// Interval between health check passes
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Upper bound for a single node probe
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        require_positive("load_balancer.health_check_interval_ms", self.health_check_interval_ms)?;
        require_positive("load_balancer.health_check_timeout_ms", self.health_check_timeout_ms)?;
        require_positive("load_balancer.latency_window", self.latency_window as u64)?;
        if self.latency_window > MAX_LATENCY_WINDOW {
            return Err(Error::Config(format!(
                "load_balancer.latency_window must not exceed {}",
                MAX_LATENCY_WINDOW
            )));
        }
        require_positive("load_balancer.event_channel_capacity", self.event_channel_capacity as u64)
    }
}

/// Adaptive strategy selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    /// Whether the evaluation loop runs
    pub enabled: bool,
    /// Interval between strategy evaluations
    pub evaluation_interval_ms: u64,
    /// Scores kept per strategy
    pub window_size: usize,
    /// Average score below which the active strategy is replaced
    pub switch_threshold: f64,
    /// Probability of switching to the best strategy regardless of score
    pub exploration_rate: f64,
    /// Latency at which the latency term bottoms out
    pub latency_cap_ms: f64,
    /// Throughput at which the throughput term saturates
    pub throughput_cap_per_minute: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_ms: 60_000,
            window_size: 10,
            switch_threshold: 0.7,
            exploration_rate: 0.1,
            latency_cap_ms: 5_000.0,
            throughput_cap_per_minute: 1_000.0,
        }
    }
}

impl AdaptiveSettings {
    /// Interval between strategy evaluations
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        require_positive("adaptive.evaluation_interval_ms", self.evaluation_interval_ms)?;
        require_positive("adaptive.window_size", self.window_size as u64)?;
        require_fraction("adaptive.switch_threshold", self.switch_threshold)?;
        require_fraction("adaptive.exploration_rate", self.exploration_rate)?;
        if self.latency_cap_ms <= 0.0 || self.throughput_cap_per_minute <= 0.0 {
            return Err(Error::Config(
                "adaptive latency and throughput caps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Dynamic scaler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerSettings {
    /// Whether the scaling loop runs
    pub enabled: bool,
    /// Interval between scaling evaluations
    pub evaluation_interval_ms: u64,
    /// CPU utilization above which capacity is added
    pub scale_up_cpu: f64,
    /// CPU utilization below which capacity may be removed
    pub scale_down_cpu: f64,
    /// Memory utilization above which capacity is added
    pub scale_up_memory: f64,
    /// Memory utilization below which capacity may be removed
    pub scale_down_memory: f64,
    /// Queued work above which capacity is added
    pub scale_up_queue_length: u64,
    /// Queued work below which capacity may be removed
    pub scale_down_queue_length: u64,
    /// Mean latency above which capacity is added
    pub scale_up_latency_ms: f64,
    /// Mean latency below which capacity may be removed
    pub scale_down_latency_ms: f64,
    /// Minimum time between scale-up actions
    pub scale_up_delay_ms: u64,
    /// Time under-utilization must persist before a scale-down
    pub scale_down_delay_ms: u64,
    /// Lower bound on registered nodes
    pub min_nodes: usize,
    /// Upper bound on registered nodes
    pub max_nodes: usize,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_ms: 10_000,
            scale_up_cpu: 0.8,
            scale_down_cpu: 0.3,
            scale_up_memory: 0.85,
            scale_down_memory: 0.4,
            scale_up_queue_length: 100,
            scale_down_queue_length: 10,
            scale_up_latency_ms: 2_000.0,
            scale_down_latency_ms: 500.0,
            scale_up_delay_ms: 30_000,
            scale_down_delay_ms: 60_000,
            min_nodes: 1,
            max_nodes: 10,
        }
    }
}

impl ScalerSettings {
    /// Interval between scaling evaluations
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    /// Minimum time between scale-up actions
    pub fn scale_up_delay(&self) -> Duration {
        Duration::from_millis(self.scale_up_delay_ms)
    }

    /// Time under-utilization must persist before a scale-down
    pub fn scale_down_delay(&self) -> Duration {
        Duration::from_millis(self.scale_down_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        require_positive("scaler.evaluation_interval_ms", self.evaluation_interval_ms)?;
        require_fraction("scaler.scale_up_cpu", self.scale_up_cpu)?;
        require_fraction("scaler.scale_down_cpu", self.scale_down_cpu)?;
        require_fraction("scaler.scale_up_memory", self.scale_up_memory)?;
        require_fraction("scaler.scale_down_memory", self.scale_down_memory)?;

        if self.scale_down_cpu > self.scale_up_cpu
            || self.scale_down_memory > self.scale_up_memory
            || self.scale_down_queue_length > self.scale_up_queue_length
            || self.scale_down_latency_ms > self.scale_up_latency_ms
        {
            return Err(Error::Config(
                "scale-down thresholds must not exceed scale-up thresholds".to_string(),
            ));
        }

        if self.min_nodes > self.max_nodes {
            return Err(Error::Config(format!(
                "scaler.min_nodes ({}) exceeds scaler.max_nodes ({})",
                self.min_nodes, self.max_nodes
            )));
        }

        Ok(())
    }
}

/// Queue manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum number of queued work items
    pub max_queue_size: usize,
    /// Maximum number of items routed concurrently
    pub max_concurrent_dispatches: usize,
    /// Wait before a lower lane is served ahead of more urgent work
    pub starvation_threshold_ms: u64,
    /// Timeout applied to items that do not carry their own
    pub default_timeout_ms: u64,
    /// Delay before a failed item is put back on the queue
    pub retry_backoff_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_concurrent_dispatches: 64,
            starvation_threshold_ms: 30_000,
            default_timeout_ms: 30_000,
            retry_backoff_ms: 100,
        }
    }
}

impl QueueSettings {
    /// Wait before a lower lane is served ahead of more urgent work
    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }

    /// Timeout applied to items that do not carry their own
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Delay before a failed item is put back on the queue
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        require_positive("queue.max_queue_size", self.max_queue_size as u64)?;
        require_positive("queue.max_concurrent_dispatches", self.max_concurrent_dispatches as u64)?;
        require_positive("queue.default_timeout_ms", self.default_timeout_ms)
    }
}

/// Request cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether identical work is short-circuited
    pub enabled: bool,
    /// Maximum cached results
    pub max_entries: usize,
    /// Lifetime of a cached result
    pub ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_024,
            ttl_ms: 300_000,
        }
    }
}

impl CacheSettings {
    /// Lifetime of a cached result
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.enabled {
            require_positive("cache.max_entries", self.max_entries as u64)?;
            require_positive("cache.ttl_ms", self.ttl_ms)?;
        }
        Ok(())
    }
}

/// Resource sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Interval between system samples
    pub sample_interval_ms: u64,
    /// Memory withheld from the reported available memory
    pub reserved_memory_bytes: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            reserved_memory_bytes: 0,
        }
    }
}

impl ResourceSettings {
    /// Interval between system samples
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        require_positive("resources.sample_interval_ms", self.sample_interval_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Directory for daily-rotated log files, stdout only when unset
    pub directory: Option<String>,
    /// File name prefix for rotated log files
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            file_prefix: "dispatch".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = DispatchSettings::default();

        assert!(settings.validate().is_ok());
        assert_eq!(settings.load_balancer.health_check_interval(), Duration::from_secs(30));
        assert_eq!(settings.adaptive.evaluation_interval(), Duration::from_secs(60));
        assert_eq!(settings.scaler.scale_up_delay(), Duration::from_secs(30));
        assert_eq!(settings.scaler.scale_down_delay(), Duration::from_secs(60));
        assert_eq!(settings.load_balancer.latency_window, 100);
        assert_eq!(settings.adaptive.window_size, 10);
    }

    #[test]
    fn test_inverted_scaler_thresholds_rejected() {
        let mut settings = DispatchSettings::default();
        settings.scaler.scale_down_cpu = 0.9;

        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_exploration_rate_out_of_range_rejected() {
        let mut settings = DispatchSettings::default();
        settings.adaptive.exploration_rate = 1.5;

        assert!(settings.validate().is_err());
    }
}
