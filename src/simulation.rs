//! Simulated inference nodes
//!
//! Provisions local worker pools whose workers sleep for a random latency
//! and answer with a synthetic completion. Used by the binary to drive the
//! dispatcher without real model backends.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;

use common::error::{Error, Result};
use common::types::WorkItem;
use scaling_adapter::{NodeProvisioner, ProvisionedNode};
use worker_pool::LocalWorkerPool;

/// Provisioner of simulated inference nodes
#[derive(Debug)]
pub struct SimulatedProvisioner {
    workers: usize,
    latency_ms: Range<u64>,
    failure_rate: f64,
    provisioned: AtomicUsize,
}

impl SimulatedProvisioner {
    /// Creates a provisioner of nodes with `workers` slots each
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            latency_ms: 20..120,
            failure_rate: 0.0,
            provisioned: AtomicUsize::new(0),
        }
    }

    /// Sets the simulated per-item latency range
    pub fn with_latency(mut self, latency_ms: Range<u64>) -> Self {
        if !latency_ms.is_empty() {
            self.latency_ms = latency_ms;
        }
        self
    }

    /// Sets the fraction of items that fail
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = common::utils::clamp_unit(failure_rate);
        self
    }

    /// Number of nodes provisioned so far
    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    fn pool(&self, name: String) -> LocalWorkerPool {
        let latency_ms = self.latency_ms.clone();
        let failure_rate = self.failure_rate;
        let node = name.clone();

        LocalWorkerPool::new(name, self.workers, move |item: WorkItem| {
            let (delay, fail) = {
                let mut rng = rand::thread_rng();
                (
                    Duration::from_millis(rng.gen_range(latency_ms.clone())),
                    rng.gen_bool(failure_rate),
                )
            };
            let node = node.clone();

            async move {
                tokio::time::sleep(delay).await;
                if fail {
                    return Err(Error::Internal(format!("Simulated failure on {}", node)));
                }
                Ok(json!({
                    "node": node,
                    "item": item.id(),
                    "latency_ms": delay.as_millis() as u64,
                }))
            }
        })
    }
}

#[async_trait]
impl NodeProvisioner for SimulatedProvisioner {
    async fn provision(&self) -> Result<ProvisionedNode> {
        let index = self.provisioned.fetch_add(1, Ordering::SeqCst);
        let id = format!("sim-node-{}", index);

        Ok(ProvisionedNode {
            pool: Arc::new(self.pool(id.clone())),
            id,
            weight: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_pool::WorkerPool;

    #[tokio::test(start_paused = true)]
    async fn test_provisioned_pool_answers() {
        let provisioner = SimulatedProvisioner::new(2).with_latency(5..6);

        let node = provisioner.provision().await.unwrap();
        assert_eq!(node.id, "sim-node-0");

        let output = node
            .pool
            .process_request(WorkItem::new(json!({})).with_id("job"))
            .await
            .unwrap();
        assert_eq!(output["node"], "sim-node-0");
        assert_eq!(output["item"], "job");
        assert_eq!(output["latency_ms"], 5);
        assert_eq!(node.pool.get_stats().total_workers, 2);

        assert_eq!(provisioner.provision().await.unwrap().id, "sim-node-1");
        assert_eq!(provisioner.provisioned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_one_always_fails() {
        let provisioner = SimulatedProvisioner::new(1).with_failure_rate(1.0);
        let node = provisioner.provision().await.unwrap();

        assert!(node.pool.process_request(WorkItem::new(json!({}))).await.is_err());
    }
}
