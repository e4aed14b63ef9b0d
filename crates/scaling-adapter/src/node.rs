//! Registered routing targets
//!
//! A [`Node`] wraps one worker pool together with the health and metrics
//! bookkeeping the load balancer keeps for it. All mutable bookkeeping sits
//! behind the node's own mutex, so request completions and health checks on
//! the same node serialize while different nodes proceed independently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use common::models::{HealthStatus, NodeHealth, NodeMetrics};
use common::utils::clamp_unit;
use worker_pool::{PoolStats, WorkerPool};

use crate::stats::NodeStats;
use crate::strategy::Candidate;

/// Bounded FIFO window of observed latencies
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    /// Latencies in milliseconds, oldest first
    samples: VecDeque<f64>,

    /// Maximum number of samples kept
    capacity: usize,
}

impl LatencyHistory {
    /// Creates an empty window holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a latency, evicting the oldest sample when full
    pub fn record(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Mean of the recorded latencies, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Number of recorded samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no sample was recorded
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest recorded sample
    pub fn oldest(&self) -> Option<f64> {
        self.samples.front().copied()
    }
}

/// Mutable bookkeeping of a node
#[derive(Debug)]
struct NodeState {
    health: NodeHealth,
    metrics: NodeMetrics,
    latencies: LatencyHistory,
    total_requests: u64,
    failed_requests: u64,
    requests_at_last_check: u64,
    last_check_at: Option<Instant>,
}

/// A registered routing target
pub struct Node {
    /// Node identifier
    id: String,

    /// Worker pool executing the node's work
    pool: Arc<dyn WorkerPool>,

    /// Routing weight
    weight: f64,

    /// Requests routed to the node and not yet finished
    in_flight: AtomicU64,

    /// Health and metrics bookkeeping
    state: Mutex<NodeState>,
}

impl Node {
    /// Creates a node with full health and zeroed metrics
    pub fn new(
        id: impl Into<String>,
        pool: Arc<dyn WorkerPool>,
        weight: f64,
        latency_window: usize,
    ) -> Self {
        Self {
            id: id.into(),
            pool,
            weight,
            in_flight: AtomicU64::new(0),
            state: Mutex::new(NodeState {
                health: NodeHealth::full(),
                metrics: NodeMetrics::default(),
                latencies: LatencyHistory::new(latency_window),
                total_requests: 0,
                failed_requests: 0,
                requests_at_last_check: 0,
                last_check_at: None,
            }),
        }
    }

    /// Gets the node identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the worker pool
    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    /// Gets the routing weight
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Gets the current health
    pub fn health(&self) -> NodeHealth {
        self.state.lock().health.clone()
    }

    /// Gets the current health status
    pub fn status(&self) -> HealthStatus {
        self.state.lock().health.status
    }

    /// Gets the current metrics
    pub fn metrics(&self) -> NodeMetrics {
        self.state.lock().metrics.clone()
    }

    /// Gets the number of in-flight requests
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Gets the number of latency samples kept
    pub fn latency_samples(&self) -> usize {
        self.state.lock().latencies.len()
    }

    /// Builds a selection candidate, or `None` if the node is not eligible
    pub fn candidate(&self) -> Option<Candidate> {
        let (health, metrics) = {
            let state = self.state.lock();
            if !state.health.status.is_eligible() {
                return None;
            }
            (state.health.clone(), state.metrics.clone())
        };

        Some(Candidate {
            id: self.id.clone(),
            weight: self.weight,
            health,
            metrics,
            pool: self.pool.get_stats(),
            accelerator: self.pool.supports_accelerator(),
        })
    }

    /// Marks a request as routed to this node
    pub(crate) fn begin_request(&self) {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().metrics.active_connections = active;
    }

    /// Accounts a finished request
    pub(crate) fn finish_request(&self, latency_ms: f64, success: bool) {
        let active = self
            .in_flight
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);

        let mut state = self.state.lock();
        state.total_requests += 1;
        if !success {
            state.failed_requests += 1;
        }
        state.latencies.record(latency_ms);

        let mean = state.latencies.mean();
        let error_rate = clamp_unit(state.failed_requests as f64 / state.total_requests as f64);
        state.metrics.average_latency_ms = mean;
        state.metrics.error_rate = error_rate;
        state.metrics.active_connections = active;
    }

    /// Refreshes pool-derived metrics ahead of scoring
    pub(crate) fn refresh_metrics(
        &self,
        pool: &PoolStats,
        memory_utilization: Option<f64>,
        now: Instant,
    ) {
        let active = self.in_flight();
        let mut state = self.state.lock();

        let requests_per_second = match state.last_check_at {
            Some(previous) => {
                let elapsed = now.saturating_duration_since(previous).as_secs_f64();
                if elapsed > 0.0 {
                    (state.total_requests - state.requests_at_last_check) as f64 / elapsed
                } else {
                    state.metrics.requests_per_second
                }
            }
            None => 0.0,
        };

        state.requests_at_last_check = state.total_requests;
        state.last_check_at = Some(now);

        state.metrics.requests_per_second = requests_per_second;
        state.metrics.cpu_utilization = pool.worker_utilization();
        if let Some(memory) = memory_utilization {
            state.metrics.memory_utilization = clamp_unit(memory);
        }
        state.metrics.queue_depth = pool.waiting_requests();
        state.metrics.active_connections = active;
    }

    /// Replaces the health, returning the previous one
    pub(crate) fn set_health(&self, health: NodeHealth) -> NodeHealth {
        std::mem::replace(&mut self.state.lock().health, health)
    }

    /// Gets a read-only view of the node's bookkeeping
    pub fn stats(&self) -> NodeStats {
        let state = self.state.lock();
        NodeStats {
            id: self.id.clone(),
            weight: self.weight,
            status: state.health.status,
            health_score: state.health.score,
            issues: state.health.issues.clone(),
            total_requests: state.total_requests,
            failed_requests: state.failed_requests,
            active_connections: self.in_flight(),
            average_latency_ms: state.metrics.average_latency_ms,
            latency_samples: state.latencies.len(),
            error_rate: state.metrics.error_rate,
            requests_per_second: state.metrics.requests_per_second,
            cpu_utilization: state.metrics.cpu_utilization,
            memory_utilization: state.metrics.memory_utilization,
            queue_depth: state.metrics.queue_depth,
            last_check: state.health.last_check,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::error::Result;
    use common::types::{WorkItem, WorkOutput};
    use std::time::Duration;

    struct IdlePool;

    #[async_trait]
    impl WorkerPool for IdlePool {
        async fn process_request(&self, item: WorkItem) -> Result<WorkOutput> {
            Ok(item.payload().clone())
        }

        fn get_stats(&self) -> PoolStats {
            PoolStats {
                total_requests: 12,
                completed_requests: 4,
                active_workers: 3,
                total_workers: 4,
            }
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn node() -> Node {
        Node::new("n1", Arc::new(IdlePool), 1.0, 100)
    }

    #[test]
    fn test_latency_history_is_bounded_fifo() {
        let mut history = LatencyHistory::new(100);
        for i in 0..150 {
            history.record(i as f64);
        }

        assert_eq!(history.len(), 100);
        assert_eq!(history.oldest(), Some(50.0));
        assert_eq!(history.mean(), (50..150).sum::<i32>() as f64 / 100.0);
    }

    #[test]
    fn test_new_node_has_full_health() {
        let node = node();

        assert_eq!(node.health().score, 100);
        assert_eq!(node.status(), HealthStatus::Healthy);
        assert_eq!(node.metrics(), NodeMetrics::default());
    }

    #[test]
    fn test_request_accounting() {
        let node = node();

        node.begin_request();
        node.begin_request();
        assert_eq!(node.metrics().active_connections, 2);

        node.finish_request(100.0, true);
        node.finish_request(300.0, false);

        let stats = node.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.average_latency_ms, 200.0);
        assert_eq!(stats.error_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_metrics_derives_rates() {
        let node = node();
        node.refresh_metrics(&node.pool().get_stats(), Some(0.25), Instant::now());

        for _ in 0..20 {
            node.begin_request();
            node.finish_request(10.0, true);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        node.refresh_metrics(&node.pool().get_stats(), None, Instant::now());

        let metrics = node.metrics();
        assert_eq!(metrics.requests_per_second, 2.0);
        assert_eq!(metrics.cpu_utilization, 0.75);
        assert_eq!(metrics.memory_utilization, 0.25);
        assert_eq!(metrics.queue_depth, 5);
    }

    #[test]
    fn test_unhealthy_node_is_not_a_candidate() {
        let node = node();
        assert!(node.candidate().is_some());

        node.set_health(NodeHealth::failed("probe failed"));
        assert!(node.candidate().is_none());
    }
}
