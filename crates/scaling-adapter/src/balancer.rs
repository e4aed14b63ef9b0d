//! Load balancer implementation
//!
//! This module owns the node registry, routes work items under the active
//! strategy, accounts request outcomes per node and runs the periodic health
//! check pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::error::{Error, NodeShutdownFailure, Result};
use common::models::{HealthStatus, NodeHealth, ResourceSnapshot};
use common::task::BackgroundTask;
use common::types::{Strategy, WorkItem, WorkOutput};
use common::utils::execute_with_timeout;
use orchestrator_config::{LoadBalancerSettings, MAX_LATENCY_WINDOW};
use resource_manager::ResourceManager;
use worker_pool::WorkerPool;

use crate::events::BalancerEvent;
use crate::health::compute_health;
use crate::node::Node;
use crate::router::RequestRouter;
use crate::stats::BalancerStats;
use crate::strategy::{self, Candidate};

/// Routing weight of a node added without an explicit weight
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Accounts a routed request when finished or dropped
struct RequestGuard {
    node: Arc<Node>,
    started: Instant,
    finished: bool,
}

impl RequestGuard {
    fn start(node: Arc<Node>) -> Self {
        node.begin_request();
        Self {
            node,
            started: Instant::now(),
            finished: false,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn finish(mut self, success: bool) -> f64 {
        let latency_ms = self.elapsed_ms();
        self.node.finish_request(latency_ms, success);
        self.finished = true;
        latency_ms
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        // An abandoned request counts as a failure
        if !self.finished {
            self.node.finish_request(self.elapsed_ms(), false);
        }
    }
}

/// Health-aware load balancer over a registry of worker-pool nodes
pub struct LoadBalancer {
    /// Registered nodes, in registration order
    nodes: RwLock<Vec<Arc<Node>>>,

    /// Active strategy
    strategy: RwLock<Strategy>,

    /// Round-robin position
    cursor: AtomicUsize,

    /// Resource snapshot source for resource-aware routing and memory metrics
    resource_manager: Option<Arc<dyn ResourceManager>>,

    /// Balancer settings
    settings: LoadBalancerSettings,

    /// Event channel
    events: broadcast::Sender<BalancerEvent>,

    /// Health check loop, present while started
    health_task: Mutex<Option<BackgroundTask>>,
}

impl LoadBalancer {
    /// Creates a load balancer without a resource manager
    pub fn new(settings: LoadBalancerSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));

        info!("Load balancer created with strategy {}", settings.strategy);

        Self {
            nodes: RwLock::new(Vec::new()),
            strategy: RwLock::new(settings.strategy),
            cursor: AtomicUsize::new(0),
            resource_manager: None,
            settings,
            events,
            health_task: Mutex::new(None),
        }
    }

    /// Attaches a resource manager
    pub fn with_resource_manager(mut self, resource_manager: Arc<dyn ResourceManager>) -> Self {
        self.resource_manager = Some(resource_manager);
        self
    }

    /// Subscribes to balancer events
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: BalancerEvent) {
        // No subscriber is not an error
        let _ = self.events.send(event);
    }

    /// Registers a node with full health and zeroed metrics
    pub fn add_node(
        &self,
        id: impl Into<String>,
        pool: Arc<dyn WorkerPool>,
        weight: f64,
    ) -> Result<()> {
        let id = id.into();

        if !weight.is_finite() || weight <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "Node {} weight must be positive, got {}",
                id, weight
            )));
        }

        {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|node| node.id() == id) {
                return Err(Error::AlreadyExists(format!("Node {}", id)));
            }

            let window = self.settings.latency_window.clamp(1, MAX_LATENCY_WINDOW);
            nodes.push(Arc::new(Node::new(id.clone(), pool, weight, window)));
        }

        info!("Added node {} with weight {}", id, weight);
        self.publish(BalancerEvent::NodeAdded { node_id: id, weight });

        Ok(())
    }

    /// Shuts down a node's worker pool and removes its bookkeeping.
    ///
    /// The node is removed even if its pool fails to shut down; the failure
    /// is returned as [`Error::NodeShutdown`].
    pub async fn remove_node(&self, id: &str) -> Result<()> {
        let node = self
            .detach(id)
            .ok_or_else(|| Error::NotFound(format!("Node {}", id)))?;

        let result = shutdown_node(&node).await;
        self.publish(BalancerEvent::NodeRemoved {
            node_id: id.to_string(),
        });

        match result {
            Ok(()) => {
                info!("Removed node {}", id);
                Ok(())
            }
            Err(failure) => {
                error!("Removed node {} but its pool failed to shut down: {}", id, failure.reason);
                Err(Error::NodeShutdown(vec![failure]))
            }
        }
    }

    /// Removes several nodes concurrently.
    ///
    /// Every removal runs to completion; failures are aggregated into one
    /// [`Error::NodeShutdown`].
    pub async fn remove_nodes<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let results = join_all(ids.iter().map(|id| self.remove_node(id))).await;

        let mut failures = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(Error::NodeShutdown(mut node_failures)) => failures.append(&mut node_failures),
                Err(other) => failures.push(NodeShutdownFailure {
                    node_id: id.clone(),
                    reason: other.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::NodeShutdown(failures))
        }
    }

    fn detach(&self, id: &str) -> Option<Arc<Node>> {
        let mut nodes = self.nodes.write();
        let position = nodes.iter().position(|node| node.id() == id)?;
        Some(nodes.remove(position))
    }

    /// Routes a work item to a node selected by the active strategy.
    ///
    /// The node's counters, latency window and error rate are updated
    /// whether the pool succeeds or fails.
    pub async fn route_request(&self, item: WorkItem) -> Result<WorkOutput> {
        let node = self.select_node(&item).await?;
        let item_id = item.id().to_string();

        debug!("Routing work item {} to node {}", item_id, node.id());

        let guard = RequestGuard::start(node.clone());
        let result = node.pool().process_request(item).await;
        let latency_ms = guard.finish(result.is_ok());

        match result {
            Ok(output) => {
                debug!(
                    "Work item {} completed on node {} in {:.1}ms",
                    item_id,
                    node.id(),
                    latency_ms
                );
                self.publish(BalancerEvent::RequestCompleted {
                    node_id: node.id().to_string(),
                    item_id,
                    latency_ms,
                });
                Ok(output)
            }
            Err(e) => {
                error!("Work item {} failed on node {}: {}", item_id, node.id(), e);
                self.publish(BalancerEvent::RequestFailed {
                    node_id: node.id().to_string(),
                    item_id,
                    error: e.to_string(),
                });
                Err(match e {
                    Error::RequestExecution { .. } => e,
                    other => Error::request_execution(node.id(), other),
                })
            }
        }
    }

    async fn select_node(&self, item: &WorkItem) -> Result<Arc<Node>> {
        let strategy = self.strategy();
        let resources = if strategy == Strategy::ResourceAware {
            self.current_resources().await
        } else {
            None
        };

        let nodes = self.nodes.read().clone();
        let (eligible, candidates): (Vec<Arc<Node>>, Vec<Candidate>) = nodes
            .into_iter()
            .filter_map(|node| node.candidate().map(|candidate| (node, candidate)))
            .unzip();

        let index = strategy::select(strategy, &candidates, item, &self.cursor, resources.as_ref())
            .ok_or(Error::NoHealthyNodes)?;

        Ok(eligible[index].clone())
    }

    async fn current_resources(&self) -> Option<ResourceSnapshot> {
        let manager = self.resource_manager.as_ref()?;
        match manager.get_current_resources().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Failed to read resource snapshot: {}", e);
                None
            }
        }
    }

    /// Gets aggregate and per-node statistics
    pub fn get_stats(&self) -> BalancerStats {
        let per_node = self.nodes.read().iter().map(|node| node.stats()).collect();
        BalancerStats::from_nodes(self.strategy(), per_node)
    }

    /// Gets the active strategy
    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    /// Replaces the active strategy and resets the round-robin cursor
    pub fn update_strategy(&self, strategy: Strategy) {
        let previous = {
            let mut current = self.strategy.write();
            self.cursor.store(0, Ordering::SeqCst);
            std::mem::replace(&mut *current, strategy)
        };

        if previous != strategy {
            info!("Load balancing strategy changed from {} to {}", previous, strategy);
            self.publish(BalancerEvent::StrategyChanged {
                from: previous,
                to: strategy,
            });
        }
    }

    /// Gets the identifiers of nodes eligible for routing, in registration order
    pub fn get_healthy_nodes(&self) -> Vec<String> {
        self.nodes
            .read()
            .iter()
            .filter(|node| node.status().is_eligible())
            .map(|node| node.id().to_string())
            .collect()
    }

    /// Gets the identifiers of all registered nodes
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.read().iter().map(|node| node.id().to_string()).collect()
    }

    /// Gets the number of registered nodes
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Gets a registered node
    pub fn get_node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|node| node.id() == id).cloned()
    }

    /// Runs one health check pass over every node concurrently
    pub async fn perform_health_check(&self) {
        let nodes = self.nodes.read().clone();
        if nodes.is_empty() {
            return;
        }

        let memory = self
            .current_resources()
            .await
            .map(|snapshot| snapshot.memory_utilization());
        let now = Instant::now();
        let timeout = self.settings.health_check_timeout();

        join_all(
            nodes
                .iter()
                .map(|node| self.check_node(node, memory, now, timeout)),
        )
        .await;

        debug!("Health check completed for {} nodes", nodes.len());
    }

    async fn check_node(&self, node: &Node, memory: Option<f64>, now: Instant, timeout: Duration) {
        let probe = execute_with_timeout(node.pool().health_probe(), timeout, "health probe").await;

        let health = match probe {
            Ok(()) => {
                node.refresh_metrics(&node.pool().get_stats(), memory, now);
                compute_health(&node.metrics())
            }
            Err(e) => {
                let failure = Error::health_check(node.id(), e);
                warn!("{}", failure);
                NodeHealth::failed(failure.to_string())
            }
        };

        let (status, score) = (health.status, health.score);
        let previous = node.set_health(health);

        if previous.status != status {
            if status == HealthStatus::Healthy {
                info!("Node {} recovered: {} -> {} (score {})", node.id(), previous.status, status, score);
            } else {
                warn!("Node {} health changed: {} -> {} (score {})", node.id(), previous.status, status, score);
            }
            self.publish(BalancerEvent::HealthChanged {
                node_id: node.id().to_string(),
                from: previous.status,
                to: status,
                score,
            });
        }
    }

    /// Starts the periodic health check. Does nothing if disabled or
    /// already started.
    pub fn start_health_checks(self: &Arc<Self>) {
        if !self.settings.health_checks_enabled {
            return;
        }

        let mut task = self.health_task.lock();
        if task.is_some() {
            return;
        }

        let balancer = Arc::downgrade(self);
        *task = Some(BackgroundTask::spawn(
            "health-check",
            self.settings.health_check_interval(),
            move || {
                let balancer = balancer.clone();
                async move {
                    if let Some(balancer) = balancer.upgrade() {
                        balancer.perform_health_check().await;
                    }
                }
            },
        ));

        info!(
            "Health checks started with interval {:?}",
            self.settings.health_check_interval()
        );
    }

    /// Stops the periodic health check
    pub async fn stop_health_checks(&self) {
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Stops the health check, shuts every pool down and clears the registry.
    ///
    /// Every pool is shut down even if some fail; failures are aggregated
    /// into one [`Error::NodeShutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down load balancer");

        self.stop_health_checks().await;

        let nodes = std::mem::take(&mut *self.nodes.write());
        self.cursor.store(0, Ordering::SeqCst);

        let results = join_all(nodes.iter().map(|node| shutdown_node(node))).await;
        let failures: Vec<NodeShutdownFailure> =
            results.into_iter().filter_map(|result| result.err()).collect();

        for node in &nodes {
            self.publish(BalancerEvent::NodeRemoved {
                node_id: node.id().to_string(),
            });
        }

        if failures.is_empty() {
            info!("Load balancer shut down, {} nodes released", nodes.len());
            Ok(())
        } else {
            let failure = Error::NodeShutdown(failures);
            error!("Load balancer shut down with failures: {}", failure);
            Err(failure)
        }
    }
}

async fn shutdown_node(node: &Node) -> std::result::Result<(), NodeShutdownFailure> {
    node.pool()
        .shutdown()
        .await
        .map_err(|e| NodeShutdownFailure {
            node_id: node.id().to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl RequestRouter for LoadBalancer {
    async fn route_request(&self, item: WorkItem) -> Result<WorkOutput> {
        LoadBalancer::route_request(self, item).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::types::{Priority, ResourceRequirement};
    use resource_manager::StaticResourceManager;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;
    use worker_pool::PoolStats;

    /// Pool answering with its own name; payloads with `"fail": true` fail
    #[derive(Default)]
    pub(crate) struct TestPool {
        pub name: String,
        pub fail_shutdown: bool,
        pub fail_probe: bool,
        pub delay: Duration,
        pub shutdowns: AtomicU64,
        pub calls: AtomicU64,
    }

    impl TestPool {
        pub fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl WorkerPool for TestPool {
        async fn process_request(&self, item: WorkItem) -> Result<WorkOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if item.payload()["fail"] == json!(true) {
                return Err(Error::Internal("inference failed".to_string()));
            }
            Ok(json!(self.name))
        }

        fn get_stats(&self) -> PoolStats {
            PoolStats {
                total_workers: 4,
                ..Default::default()
            }
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                return Err(Error::Resource("pool stuck".to_string()));
            }
            Ok(())
        }

        async fn health_probe(&self) -> Result<()> {
            if self.fail_probe {
                return Err(Error::Resource("probe refused".to_string()));
            }
            Ok(())
        }
    }

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(LoadBalancerSettings::default())
    }

    fn ok_item() -> WorkItem {
        WorkItem::new(json!({"fail": false}))
    }

    fn failing_item() -> WorkItem {
        WorkItem::new(json!({"fail": true}))
    }

    #[tokio::test]
    async fn test_round_robin_visits_in_registration_order() {
        let balancer = balancer();
        for name in ["A", "B", "C"] {
            balancer.add_node(name, Arc::new(TestPool::named(name)), DEFAULT_WEIGHT).unwrap();
        }

        let mut route = Vec::new();
        for _ in 0..6 {
            route.push(balancer.route_request(ok_item()).await.unwrap());
        }

        assert_eq!(route, vec![json!("A"), json!("B"), json!("C"), json!("A"), json!("B"), json!("C")]);
    }

    #[tokio::test]
    async fn test_no_healthy_nodes() {
        let balancer = balancer();
        assert!(balancer.route_request(ok_item()).await.unwrap_err().is_no_healthy_nodes());

        let pool = TestPool {
            fail_probe: true,
            ..TestPool::named("A")
        };
        balancer.add_node("A", Arc::new(pool), DEFAULT_WEIGHT).unwrap();
        balancer.perform_health_check().await;

        assert!(balancer.get_healthy_nodes().is_empty());
        assert!(balancer.route_request(ok_item()).await.unwrap_err().is_no_healthy_nodes());
    }

    #[tokio::test]
    async fn test_add_node_validation() {
        let balancer = balancer();
        balancer.add_node("A", Arc::new(TestPool::named("A")), 1.0).unwrap();

        assert!(balancer
            .add_node("A", Arc::new(TestPool::named("A")), 1.0)
            .unwrap_err()
            .is_already_exists());
        assert!(matches!(
            balancer.add_node("B", Arc::new(TestPool::named("B")), 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(balancer.node_count(), 1);
    }

    #[tokio::test]
    async fn test_healthy_nodes_follow_registry() {
        let balancer = balancer();
        for name in ["A", "B", "C"] {
            balancer.add_node(name, Arc::new(TestPool::named(name)), 1.0).unwrap();
        }
        assert_eq!(balancer.get_healthy_nodes(), vec!["A", "B", "C"]);

        balancer.remove_node("B").await.unwrap();
        assert_eq!(balancer.get_healthy_nodes(), vec!["A", "C"]);

        balancer.add_node("B", Arc::new(TestPool::named("B")), 1.0).unwrap();
        assert_eq!(balancer.get_healthy_nodes(), vec!["A", "C", "B"]);

        assert!(balancer.remove_node("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_error_rate_degrades_but_keeps_node_eligible() {
        let balancer = balancer();
        balancer.add_node("X", Arc::new(TestPool::named("X")), 1.0).unwrap();

        for i in 0..25 {
            let item = if i < 3 { failing_item() } else { ok_item() };
            let _ = balancer.route_request(item).await;
        }
        balancer.perform_health_check().await;

        let stats = balancer.get_stats();
        let node = stats.node("X").unwrap();
        assert_eq!(node.error_rate, 0.12);
        assert_eq!(node.health_score, 70);
        assert_eq!(node.status, HealthStatus::Degraded);
        assert_eq!(node.issues, vec!["high error rate".to_string()]);
        assert_eq!(balancer.get_healthy_nodes(), vec!["X"]);
        assert!(balancer.route_request(ok_item()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_latency_make_node_unhealthy() {
        let balancer = balancer();
        let pool = TestPool {
            delay: Duration::from_secs(6),
            ..TestPool::named("X")
        };
        balancer.add_node("X", Arc::new(pool), 1.0).unwrap();

        for i in 0..20 {
            let item = if i < 3 { failing_item() } else { ok_item() };
            let _ = balancer.route_request(item).await;
        }
        balancer.perform_health_check().await;

        let node = balancer.get_node("X").unwrap();
        let health = node.health();
        assert_eq!(node.metrics().error_rate, 0.15);
        assert_eq!(health.score, 45);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(balancer.route_request(ok_item()).await.unwrap_err().is_no_healthy_nodes());
    }

    #[tokio::test]
    async fn test_remove_node_with_failing_shutdown_still_removes() {
        let balancer = balancer();
        let pool = TestPool {
            fail_shutdown: true,
            ..TestPool::named("A")
        };
        balancer.add_node("A", Arc::new(pool), 1.0).unwrap();
        balancer.add_node("B", Arc::new(TestPool::named("B")), 1.0).unwrap();

        let err = balancer.remove_node("A").await.unwrap_err();
        assert_eq!(err.shutdown_failures().len(), 1);
        assert_eq!(err.shutdown_failures()[0].node_id, "A");
        assert_eq!(balancer.node_ids(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_remove_nodes_settles_all() {
        let balancer = balancer();
        let failing = Arc::new(TestPool {
            fail_shutdown: true,
            ..TestPool::named("A")
        });
        let healthy = Arc::new(TestPool::named("B"));
        balancer.add_node("A", failing.clone(), 1.0).unwrap();
        balancer.add_node("B", healthy.clone(), 1.0).unwrap();

        let err = balancer.remove_nodes(["A", "B", "missing"]).await.unwrap_err();
        let failed: Vec<&str> = err.shutdown_failures().iter().map(|f| f.node_id.as_str()).collect();

        assert_eq!(failed, vec!["A", "missing"]);
        assert_eq!(healthy.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(balancer.node_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_settles_every_pool() {
        let balancer = balancer();
        let pools: Vec<Arc<TestPool>> = vec![
            Arc::new(TestPool {
                fail_shutdown: true,
                ..TestPool::named("A")
            }),
            Arc::new(TestPool::named("B")),
            Arc::new(TestPool {
                fail_shutdown: true,
                ..TestPool::named("C")
            }),
        ];
        for pool in &pools {
            balancer.add_node(pool.name.clone(), pool.clone(), 1.0).unwrap();
        }

        let err = balancer.shutdown().await.unwrap_err();

        assert_eq!(err.shutdown_failures().len(), 2);
        for pool in &pools {
            assert_eq!(pool.shutdowns.load(Ordering::SeqCst), 1);
        }
        assert_eq!(balancer.node_count(), 0);
        assert_eq!(balancer.get_stats().total_nodes, 0);
    }

    #[tokio::test]
    async fn test_update_strategy_resets_cursor() {
        let balancer = balancer();
        let mut events = balancer.subscribe();
        for name in ["A", "B", "C"] {
            balancer.add_node(name, Arc::new(TestPool::named(name)), 1.0).unwrap();
        }

        balancer.route_request(ok_item()).await.unwrap();
        balancer.route_request(ok_item()).await.unwrap();
        balancer.update_strategy(Strategy::RoundRobin);
        assert_eq!(balancer.route_request(ok_item()).await.unwrap(), json!("A"));

        balancer.update_strategy(Strategy::LeastLoaded);
        assert_eq!(balancer.strategy(), Strategy::LeastLoaded);
        assert_eq!(balancer.get_stats().strategy, Strategy::LeastLoaded);

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BalancerEvent::StrategyChanged { from, to } = event {
                changes.push((from, to));
            }
        }
        assert_eq!(changes, vec![(Strategy::RoundRobin, Strategy::LeastLoaded)]);
    }

    #[tokio::test]
    async fn test_round_robin_cursor_survives_eligibility_change() {
        let balancer = balancer();
        for name in ["A", "B", "C"] {
            balancer.add_node(name, Arc::new(TestPool::named(name)), 1.0).unwrap();
        }

        assert_eq!(balancer.route_request(ok_item()).await.unwrap(), json!("A"));
        balancer.remove_node("C").await.unwrap();

        // cursor 1 over [A, B]
        assert_eq!(balancer.route_request(ok_item()).await.unwrap(), json!("B"));
        assert_eq!(balancer.route_request(ok_item()).await.unwrap(), json!("A"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_routing_races_health_checks_and_removal() {
        let balancer = Arc::new(balancer());
        let pools: Vec<Arc<TestPool>> = ["A", "B", "C", "D"]
            .into_iter()
            .map(|name| {
                Arc::new(TestPool {
                    delay: Duration::from_millis(1),
                    ..TestPool::named(name)
                })
            })
            .collect();
        for pool in &pools {
            balancer.add_node(pool.name.clone(), pool.clone(), 1.0).unwrap();
        }

        let routers: Vec<_> = (0..4)
            .map(|_| {
                let balancer = balancer.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        balancer.route_request(ok_item()).await.unwrap();
                    }
                })
            })
            .collect();
        let checker = {
            let balancer = balancer.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    balancer.perform_health_check().await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let remover = {
            let balancer = balancer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                balancer.remove_nodes(["C", "D"]).await
            })
        };

        for router in routers {
            router.await.unwrap();
        }
        checker.await.unwrap();
        remover.await.unwrap().unwrap();

        let calls: u64 = pools.iter().map(|p| p.calls.load(Ordering::SeqCst)).sum();
        assert_eq!(calls, 200);
        for pool in &pools[..2] {
            let node = balancer.get_node(&pool.name).unwrap();
            assert_eq!(node.stats().total_requests, pool.calls.load(Ordering::SeqCst));
            assert_eq!(node.stats().active_connections, 0);
            assert_eq!(node.in_flight(), 0);
        }
        for pool in &pools[2..] {
            assert!(balancer.get_node(&pool.name).is_none());
            assert_eq!(pool.shutdowns.load(Ordering::SeqCst), 1);
        }
        assert_eq!(balancer.get_healthy_nodes(), vec!["A", "B"]);

        let removed_calls: Vec<u64> = pools[2..]
            .iter()
            .map(|p| p.calls.load(Ordering::SeqCst))
            .collect();
        for _ in 0..20 {
            let output = balancer.route_request(ok_item()).await.unwrap();
            assert!(output == json!("A") || output == json!("B"));
        }
        let after: Vec<u64> = pools[2..]
            .iter()
            .map(|p| p.calls.load(Ordering::SeqCst))
            .collect();
        assert_eq!(removed_calls, after);
        assert_eq!(balancer.get_stats().active_connections(), 0);
    }

    #[tokio::test]
    async fn test_health_check_failure_is_isolated() {
        let balancer = balancer();
        let mut events = balancer.subscribe();
        let broken = TestPool {
            fail_probe: true,
            ..TestPool::named("A")
        };
        balancer.add_node("A", Arc::new(broken), 1.0).unwrap();
        balancer.add_node("B", Arc::new(TestPool::named("B")), 1.0).unwrap();

        balancer.perform_health_check().await;

        let a = balancer.get_node("A").unwrap().health();
        assert_eq!(a.status, HealthStatus::Unhealthy);
        assert_eq!(a.score, 0);
        assert_eq!(a.issues.len(), 1);
        assert_eq!(balancer.get_node("B").unwrap().health().score, 100);
        assert_eq!(balancer.get_healthy_nodes(), vec!["B"]);

        let mut changed = None;
        while let Ok(event) = events.try_recv() {
            if let BalancerEvent::HealthChanged { node_id, to, .. } = event {
                changed = Some((node_id, to));
            }
        }
        assert_eq!(changed, Some(("A".to_string(), HealthStatus::Unhealthy)));
    }

    #[tokio::test]
    async fn test_request_failure_is_accounted_and_propagated() {
        let balancer = balancer();
        balancer.add_node("A", Arc::new(TestPool::named("A")), 1.0).unwrap();

        let err = balancer.route_request(failing_item()).await.unwrap_err();
        assert!(matches!(err, Error::RequestExecution { ref node_id, .. } if node_id == "A"));

        let stats = balancer.get_stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.error_rate, 1.0);
        assert_eq!(stats.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_resource_aware_never_fails_on_mismatch() {
        let snapshot = ResourceSnapshot::new(8 << 30, 1 << 20, 0.5);
        let balancer = LoadBalancer::new(LoadBalancerSettings {
            strategy: Strategy::ResourceAware,
            ..Default::default()
        })
        .with_resource_manager(Arc::new(StaticResourceManager::new(snapshot)));
        balancer.add_node("A", Arc::new(TestPool::named("A")), 1.0).unwrap();

        let item = ok_item()
            .with_priority(Priority::High)
            .with_requirement(ResourceRequirement::new(0.5, 4 << 30));
        assert_eq!(balancer.route_request(item).await.unwrap(), json!("A"));
    }

    #[tokio::test]
    async fn test_latency_history_is_bounded() {
        let balancer = balancer();
        balancer.add_node("A", Arc::new(TestPool::named("A")), 1.0).unwrap();

        for _ in 0..150 {
            balancer.route_request(ok_item()).await.unwrap();
        }

        let node = balancer.get_node("A").unwrap();
        assert_eq!(node.latency_samples(), 100);
        assert_eq!(node.stats().total_requests, 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_timer_runs_until_shutdown() {
        let balancer = Arc::new(balancer());
        let broken = TestPool {
            fail_probe: true,
            ..TestPool::named("A")
        };
        balancer.add_node("A", Arc::new(broken), 1.0).unwrap();

        balancer.start_health_checks();
        assert_eq!(balancer.get_healthy_nodes(), vec!["A"]);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(balancer.get_healthy_nodes().is_empty());

        balancer.shutdown().await.unwrap();
        assert!(balancer.health_task.lock().is_none());
    }
}
