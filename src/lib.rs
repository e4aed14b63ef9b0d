//! Adaptive, resource-aware dispatcher for inference worker pools
//!
//! [`DispatchOrchestrator`] wires the components together: a system resource
//! monitor feeds the load balancer and the dynamic scaler, the adaptive
//! wrapper picks the balancer's strategy, and the queue manager orders and
//! dispatches submitted work through it.

pub mod simulation;
pub mod state;

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use common::error::{Error, Result};
use common::types::{WorkItem, WorkOutput};
use orchestrator_config::ConfigManager;
use performance_monitor::{MetricsCollector, MetricsSnapshot};
use resource_manager::{ResourceManager, SystemResourceMonitor};
use scaling_adapter::{
    AdaptiveLoadBalancer, BalancerStats, DynamicScaler, LoadBalancer, NodeProvisioner,
};
use task_scheduler::{CacheStats, QueueManager, RequestCache, WorkHandle};

use crate::state::OrchestratorState;

/// Combined view of the dispatcher
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    /// Lifecycle state
    pub state: OrchestratorState,

    /// Load balancer statistics
    pub balancer: BalancerStats,

    /// Work items waiting in the queue
    pub queued: usize,

    /// Work items being routed
    pub in_flight: usize,

    /// Request cache counters, when caching is enabled
    pub cache: Option<CacheStats>,

    /// Collected metrics
    pub metrics: MetricsSnapshot,
}

/// Dispatcher built from configuration
pub struct DispatchOrchestrator {
    config_manager: Arc<ConfigManager>,
    state: RwLock<OrchestratorState>,
    resource_monitor: Arc<SystemResourceMonitor>,
    balancer: Arc<LoadBalancer>,
    adaptive: Arc<AdaptiveLoadBalancer>,
    scaler: Arc<DynamicScaler>,
    queue: Arc<QueueManager>,
    provisioner: Arc<dyn NodeProvisioner>,
    metrics: Arc<MetricsCollector>,
}

impl DispatchOrchestrator {
    /// Wires the components. Nothing runs until [`start`](Self::start).
    pub fn new(
        config_manager: Arc<ConfigManager>,
        provisioner: Arc<dyn NodeProvisioner>,
    ) -> anyhow::Result<Self> {
        let settings = config_manager.settings().clone();
        info!("Initializing dispatcher");

        let metrics = Arc::new(MetricsCollector::new().context("creating metrics collector")?);

        let resource_monitor = Arc::new(SystemResourceMonitor::new(settings.resources.clone()));
        let resources: Arc<dyn ResourceManager> = resource_monitor.clone();

        let balancer = Arc::new(
            LoadBalancer::new(settings.load_balancer.clone())
                .with_resource_manager(resources.clone()),
        );
        let adaptive = Arc::new(AdaptiveLoadBalancer::new(
            balancer.clone(),
            settings.adaptive.clone(),
        ));

        let mut queue = QueueManager::new(adaptive.clone(), settings.queue.clone())
            .with_metrics(metrics.clone());
        if let Some(cache) = RequestCache::from_settings(&settings.cache) {
            queue = queue.with_cache(cache);
        }
        let queue = Arc::new(queue);

        let scaler = Arc::new(
            DynamicScaler::new(balancer.clone(), provisioner.clone(), settings.scaler.clone())
                .with_resource_manager(resources)
                .with_backlog_source(queue.clone()),
        );

        Ok(Self {
            config_manager,
            state: RwLock::new(OrchestratorState::Created),
            resource_monitor,
            balancer,
            adaptive,
            scaler,
            queue,
            provisioner,
            metrics,
        })
    }

    /// Provisions the minimum node count and starts every background loop
    pub async fn start(&self) -> anyhow::Result<()> {
        self.state.write().transition(OrchestratorState::Starting)?;
        info!("Starting dispatcher");

        if let Err(e) = self.provision_minimum().await {
            error!("Dispatcher failed to start: {}", e);
            self.state
                .write()
                .transition(OrchestratorState::Failed(e.to_string()))?;
            return Err(anyhow::Error::new(e).context("provisioning initial nodes"));
        }

        self.resource_monitor.start();
        self.adaptive.start();
        self.queue.start();
        self.scaler.start();

        self.state.write().transition(OrchestratorState::Running)?;
        info!(
            "Dispatcher running with {} nodes",
            self.balancer.node_count()
        );
        Ok(())
    }

    async fn provision_minimum(&self) -> Result<()> {
        let min_nodes = self.config_manager.settings().scaler.min_nodes;

        while self.balancer.node_count() < min_nodes {
            let node = self.provisioner.provision().await?;
            self.balancer.add_node(node.id, node.pool, node.weight)?;
        }
        self.metrics.set_node_count(self.balancer.node_count());
        Ok(())
    }

    /// Stops every component, reporting the first failure after all ran
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.state.write().transition(OrchestratorState::Stopping)?;
        info!("Stopping dispatcher");

        self.scaler.stop().await;

        let mut first_error: Option<Error> = None;
        if let Err(e) = self.queue.shutdown().await {
            warn!("Queue manager shutdown failed: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.adaptive.shutdown().await {
            warn!("Load balancer shutdown failed: {}", e);
            first_error.get_or_insert(e);
        }
        self.resource_monitor.stop().await;
        self.metrics.set_node_count(0);

        self.state.write().transition(OrchestratorState::Stopped)?;
        info!("Dispatcher stopped");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Queues a work item
    pub fn submit(&self, item: WorkItem) -> Result<WorkHandle> {
        if !self.state.read().is_running() {
            return Err(Error::Cancelled(format!(
                "Dispatcher is {}",
                self.state.read()
            )));
        }
        self.queue.submit(item)
    }

    /// Queues a work item and waits for its output
    pub async fn execute(&self, item: WorkItem) -> Result<WorkOutput> {
        self.submit(item)?.result().await
    }

    /// Gets the lifecycle state
    pub fn state(&self) -> OrchestratorState {
        self.state.read().clone()
    }

    /// Gets a combined statistics snapshot
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            state: self.state(),
            balancer: self.adaptive.get_stats(),
            queued: self.queue.queue_len(),
            in_flight: self.queue.in_flight(),
            cache: self.queue.cache_stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Gets the configuration manager
    pub fn config_manager(&self) -> Arc<ConfigManager> {
        self.config_manager.clone()
    }

    /// Gets the load balancer
    pub fn balancer(&self) -> Arc<LoadBalancer> {
        self.balancer.clone()
    }

    /// Gets the adaptive strategy wrapper
    pub fn adaptive(&self) -> Arc<AdaptiveLoadBalancer> {
        self.adaptive.clone()
    }

    /// Gets the dynamic scaler
    pub fn scaler(&self) -> Arc<DynamicScaler> {
        self.scaler.clone()
    }

    /// Gets the queue manager
    pub fn queue(&self) -> Arc<QueueManager> {
        self.queue.clone()
    }
}
