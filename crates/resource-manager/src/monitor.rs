//! Resource monitoring implementation
//!
//! This module samples host CPU and memory usage with `sysinfo` and keeps
//! the latest sample available to readers without touching the system
//! handle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sysinfo::{CpuExt, System, SystemExt};
use tracing::{debug, info};

use common::error::Result;
use common::models::ResourceSnapshot;
use common::task::BackgroundTask;
use common::utils::format_bytes;
use orchestrator_config::ResourceSettings;

use crate::ResourceManager;

/// Resource monitor for tracking system resource usage
pub struct SystemResourceMonitor {
    /// System information
    system: Arc<Mutex<System>>,

    /// Latest sample
    latest: Arc<RwLock<ResourceSnapshot>>,

    /// Sampling settings
    settings: ResourceSettings,

    /// Sampling loop, present while started
    sampler: Mutex<Option<BackgroundTask>>,
}

impl SystemResourceMonitor {
    /// Creates a new resource monitor and takes an initial sample
    pub fn new(settings: ResourceSettings) -> Self {
        let mut system = System::new();
        let initial = Self::sample(&mut system, settings.reserved_memory_bytes);

        info!(
            "Resource monitor initialized: {} total memory, {} available",
            format_bytes(initial.total_memory_bytes),
            format_bytes(initial.available_memory_bytes)
        );

        Self {
            system: Arc::new(Mutex::new(system)),
            latest: Arc::new(RwLock::new(initial)),
            settings,
            sampler: Mutex::new(None),
        }
    }

    /// Starts periodic sampling. Calling it while started is a no-op.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return;
        }

        let system = self.system.clone();
        let latest = self.latest.clone();
        let reserved = self.settings.reserved_memory_bytes;

        *sampler = Some(BackgroundTask::spawn(
            "resource-monitor",
            self.settings.sample_interval(),
            move || {
                let snapshot = Self::sample(&mut system.lock(), reserved);
                trace_sample(&snapshot);
                *latest.write() = snapshot;
                async {}
            },
        ));

        info!("Resource monitor started with interval {:?}", self.settings.sample_interval());
    }

    /// Stops periodic sampling
    pub async fn stop(&self) {
        let sampler = self.sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop().await;
            info!("Resource monitor stopped");
        }
    }

    /// Takes a sample immediately and publishes it
    pub fn refresh(&self) -> ResourceSnapshot {
        let snapshot = Self::sample(&mut self.system.lock(), self.settings.reserved_memory_bytes);
        *self.latest.write() = snapshot.clone();
        snapshot
    }

    /// Refreshes CPU and memory counters and builds a snapshot
    fn sample(system: &mut System, reserved_memory_bytes: u64) -> ResourceSnapshot {
        system.refresh_memory();
        system.refresh_cpu();

        let total = system.total_memory();
        let available = system.available_memory().saturating_sub(reserved_memory_bytes);
        let cpu = f64::from(system.global_cpu_info().cpu_usage()) / 100.0;

        ResourceSnapshot::new(total, available, cpu)
    }
}

fn trace_sample(snapshot: &ResourceSnapshot) {
    debug!(
        cpu = snapshot.cpu_utilization,
        memory = snapshot.memory_utilization(),
        "Sampled system resources"
    );
}

#[async_trait]
impl ResourceManager for SystemResourceMonitor {
    async fn get_current_resources(&self) -> Result<ResourceSnapshot> {
        Ok(self.latest.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_snapshot_is_consistent() {
        let monitor = SystemResourceMonitor::new(ResourceSettings::default());
        let snapshot = monitor.get_current_resources().await.unwrap();

        assert!(snapshot.available_memory_bytes <= snapshot.total_memory_bytes);
        assert!((0.0..=1.0).contains(&snapshot.cpu_utilization));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let monitor = SystemResourceMonitor::new(ResourceSettings {
            sample_interval_ms: 10,
            reserved_memory_bytes: 0,
        });

        monitor.start();
        monitor.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;

        assert!(monitor.sampler.lock().is_none());
    }

    #[test]
    fn test_reserved_memory_is_withheld() {
        let monitor = SystemResourceMonitor::new(ResourceSettings {
            sample_interval_ms: 1_000,
            reserved_memory_bytes: u64::MAX,
        });

        assert_eq!(monitor.refresh().available_memory_bytes, 0);
    }
}
