//! Resource sampling for the inference dispatcher
//!
//! This crate defines the [`ResourceManager`] interface consulted by the load
//! balancer and the dynamic scaler, a `sysinfo`-backed implementation that
//! samples the host on a schedule, and a fixed snapshot source for embedding.

mod monitor;
mod snapshot;

pub use monitor::SystemResourceMonitor;
pub use snapshot::StaticResourceManager;

use async_trait::async_trait;

use common::error::Result;
use common::models::ResourceSnapshot;

/// Source of system-wide resource availability.
///
/// Sampling cadence and staleness tolerance are the implementation's
/// concern; callers only read the latest snapshot.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Gets the current resource snapshot
    async fn get_current_resources(&self) -> Result<ResourceSnapshot>;
}
