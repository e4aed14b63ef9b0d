//! Worker pool abstraction for the inference dispatcher
//!
//! A worker pool is an opaque executor of work items. The load balancer only
//! sees the [`WorkerPool`] trait: it submits items, reads utilization
//! counters and shuts the pool down when its node is removed.

mod local;

pub use local::LocalWorkerPool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::error::Result;
use common::types::{WorkItem, WorkOutput};

/// Point-in-time utilization counters of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Requests accepted since creation
    pub total_requests: u64,

    /// Requests finished, successfully or not
    pub completed_requests: u64,

    /// Workers currently executing a request
    pub active_workers: usize,

    /// Worker slots
    pub total_workers: usize,
}

impl PoolStats {
    /// Fraction of busy workers (0.0-1.0)
    pub fn worker_utilization(&self) -> f64 {
        if self.total_workers == 0 {
            return 0.0;
        }
        (self.active_workers as f64 / self.total_workers as f64).min(1.0)
    }

    /// Requests accepted but not yet picked up by a worker
    pub fn waiting_requests(&self) -> u64 {
        self.total_requests
            .saturating_sub(self.completed_requests)
            .saturating_sub(self.active_workers as u64)
    }
}

/// Executor of work items
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Executes one work item
    async fn process_request(&self, item: WorkItem) -> Result<WorkOutput>;

    /// Gets utilization counters
    fn get_stats(&self) -> PoolStats;

    /// Stops accepting work and releases the pool's workers
    async fn shutdown(&self) -> Result<()>;

    /// Liveness probe run by health checks
    async fn health_probe(&self) -> Result<()> {
        Ok(())
    }

    /// Returns true if the pool can serve accelerator work
    fn supports_accelerator(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_derivations() {
        let stats = PoolStats {
            total_requests: 10,
            completed_requests: 5,
            active_workers: 2,
            total_workers: 4,
        };

        assert_eq!(stats.worker_utilization(), 0.5);
        assert_eq!(stats.waiting_requests(), 3);
        assert_eq!(PoolStats::default().worker_utilization(), 0.0);
    }
}
