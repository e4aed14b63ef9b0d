//! Dynamic scaling
//!
//! The scaler compares load signals against scale-up and scale-down
//! thresholds. Scale-up is rate limited by a cooldown since the previous
//! scale-up; scale-down only happens after under-utilization has held for
//! the whole scale-down delay.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::task::BackgroundTask;
use orchestrator_config::ScalerSettings;
use resource_manager::ResourceManager;
use worker_pool::WorkerPool;

use crate::balancer::LoadBalancer;
use crate::stats::NodeStats;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A node created by a [`NodeProvisioner`], ready to be registered
pub struct ProvisionedNode {
    /// Node identifier
    pub id: String,

    /// Worker pool backing the node
    pub pool: Arc<dyn WorkerPool>,

    /// Routing weight
    pub weight: f64,
}

/// Creates worker pools on demand
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Provisions a new node
    async fn provision(&self) -> Result<ProvisionedNode>;
}

/// Source of work queued ahead of the load balancer
pub trait BacklogSource: Send + Sync {
    /// Number of queued work items
    fn backlog(&self) -> usize;
}

/// Load signals observed at an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSignals {
    /// CPU utilization (0.0-1.0)
    pub cpu_utilization: f64,

    /// Memory utilization (0.0-1.0)
    pub memory_utilization: f64,

    /// Queued work, ahead of and inside the worker pools
    pub queue_length: u64,

    /// Mean request latency in milliseconds
    pub average_latency_ms: f64,

    /// Registered nodes
    pub node_count: usize,
}

impl LoadSignals {
    /// Describes the first scale-up threshold crossed, if any
    pub fn scale_up_reason(&self, settings: &ScalerSettings) -> Option<String> {
        if self.cpu_utilization > settings.scale_up_cpu {
            return Some(format!(
                "cpu utilization {:.2} above {:.2}",
                self.cpu_utilization, settings.scale_up_cpu
            ));
        }
        if self.memory_utilization > settings.scale_up_memory {
            return Some(format!(
                "memory utilization {:.2} above {:.2}",
                self.memory_utilization, settings.scale_up_memory
            ));
        }
        if self.queue_length > settings.scale_up_queue_length {
            return Some(format!(
                "queue length {} above {}",
                self.queue_length, settings.scale_up_queue_length
            ));
        }
        if self.average_latency_ms > settings.scale_up_latency_ms {
            return Some(format!(
                "latency {:.0}ms above {:.0}ms",
                self.average_latency_ms, settings.scale_up_latency_ms
            ));
        }
        None
    }

    /// Returns true if every signal is below its scale-down threshold
    pub fn is_underutilized(&self, settings: &ScalerSettings) -> bool {
        self.cpu_utilization < settings.scale_down_cpu
            && self.memory_utilization < settings.scale_down_memory
            && self.queue_length < settings.scale_down_queue_length
            && self.average_latency_ms < settings.scale_down_latency_ms
    }
}

/// Outcome of a scaling evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    /// A node was provisioned and registered
    ScaleUp {
        /// New node identifier
        node_id: String,
        /// Threshold that triggered the scale-up
        reason: String,
    },

    /// A node was removed
    ScaleDown {
        /// Removed node identifier
        node_id: String,
    },

    /// Nothing changed
    Hold,
}

/// Event published by the scaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingEvent {
    /// A node was added
    ScaledUp {
        /// New node identifier
        node_id: String,
        /// Threshold that triggered the scale-up
        reason: String,
    },

    /// A node was removed
    ScaledDown {
        /// Removed node identifier
        node_id: String,
    },

    /// A scaling action failed
    ScalingFailed {
        /// Failure description
        reason: String,
    },
}

/// Cooldown bookkeeping
#[derive(Debug, Default)]
struct ScalerState {
    last_scale_up: Option<Instant>,
    underutilized_since: Option<Instant>,
}

enum Plan {
    Up(String),
    Down(String),
    Hold,
}

/// Grows and shrinks the balancer's node set from observed load
pub struct DynamicScaler {
    /// Load balancer whose nodes are scaled
    balancer: Arc<LoadBalancer>,

    /// Creates new nodes
    provisioner: Arc<dyn NodeProvisioner>,

    /// System resource source
    resource_manager: Option<Arc<dyn ResourceManager>>,

    /// Work queued ahead of the balancer
    backlog: Option<Arc<dyn BacklogSource>>,

    /// Scaler settings
    settings: ScalerSettings,

    /// Cooldown bookkeeping
    state: Mutex<ScalerState>,

    /// Event channel
    events: broadcast::Sender<ScalingEvent>,

    /// Evaluation loop, present while started
    task: Mutex<Option<BackgroundTask>>,
}

impl DynamicScaler {
    /// Creates a scaler for `balancer`
    pub fn new(
        balancer: Arc<LoadBalancer>,
        provisioner: Arc<dyn NodeProvisioner>,
        settings: ScalerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            balancer,
            provisioner,
            resource_manager: None,
            backlog: None,
            settings,
            state: Mutex::new(ScalerState::default()),
            events,
            task: Mutex::new(None),
        }
    }

    /// Attaches a resource manager
    pub fn with_resource_manager(mut self, resource_manager: Arc<dyn ResourceManager>) -> Self {
        self.resource_manager = Some(resource_manager);
        self
    }

    /// Attaches a backlog source
    pub fn with_backlog_source(mut self, backlog: Arc<dyn BacklogSource>) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Subscribes to scaling events
    pub fn subscribe(&self) -> broadcast::Receiver<ScalingEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ScalingEvent) {
        let _ = self.events.send(event);
    }

    /// Observes the current load signals
    pub async fn current_signals(&self) -> LoadSignals {
        let stats = self.balancer.get_stats();

        let snapshot = match &self.resource_manager {
            Some(manager) => match manager.get_current_resources().await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Scaler could not read resources: {}", e);
                    None
                }
            },
            None => None,
        };

        let (cpu_utilization, memory_utilization) = match snapshot {
            Some(snapshot) => (snapshot.cpu_utilization, snapshot.memory_utilization()),
            None => (
                mean_of(&stats.per_node_stats, |n| n.cpu_utilization),
                mean_of(&stats.per_node_stats, |n| n.memory_utilization),
            ),
        };

        let backlog = self.backlog.as_ref().map_or(0, |b| b.backlog() as u64);
        let in_pools: u64 = stats.per_node_stats.iter().map(|n| n.queue_depth).sum();

        LoadSignals {
            cpu_utilization,
            memory_utilization,
            queue_length: backlog + in_pools,
            average_latency_ms: stats.average_latency,
            node_count: stats.total_nodes,
        }
    }

    /// Evaluates the load once and applies at most one scaling action
    pub async fn evaluate(&self) -> Result<ScalingDecision> {
        let signals = self.current_signals().await;
        let plan = self.plan(&signals, Instant::now());

        match plan {
            Plan::Up(reason) => self.scale_up(reason).await,
            Plan::Down(node_id) => self.scale_down(node_id).await,
            Plan::Hold => Ok(ScalingDecision::Hold),
        }
    }

    fn plan(&self, signals: &LoadSignals, now: Instant) -> Plan {
        let settings = &self.settings;
        let mut state = self.state.lock();

        if signals.node_count < settings.min_nodes {
            state.underutilized_since = None;
            state.last_scale_up = Some(now);
            return Plan::Up(format!(
                "{} nodes below minimum {}",
                signals.node_count, settings.min_nodes
            ));
        }

        if let Some(reason) = signals.scale_up_reason(settings) {
            state.underutilized_since = None;

            if signals.node_count >= settings.max_nodes {
                debug!("Scale-up wanted ({}) but already at {} nodes", reason, settings.max_nodes);
                return Plan::Hold;
            }
            if let Some(last) = state.last_scale_up {
                if now.saturating_duration_since(last) < settings.scale_up_delay() {
                    debug!("Scale-up wanted ({}) but cooling down", reason);
                    return Plan::Hold;
                }
            }

            state.last_scale_up = Some(now);
            return Plan::Up(reason);
        }

        if !signals.is_underutilized(settings) {
            state.underutilized_since = None;
            return Plan::Hold;
        }

        let since = *state.underutilized_since.get_or_insert(now);
        if now.saturating_duration_since(since) < settings.scale_down_delay()
            || signals.node_count <= settings.min_nodes
        {
            return Plan::Hold;
        }

        match self.scale_down_candidate() {
            Some(node_id) => {
                state.underutilized_since = None;
                Plan::Down(node_id)
            }
            None => Plan::Hold,
        }
    }

    /// Idle node with the lowest weight, then the fewest requests
    fn scale_down_candidate(&self) -> Option<String> {
        let stats = self.balancer.get_stats();
        let mut best: Option<&NodeStats> = None;

        for node in stats.per_node_stats.iter().filter(|n| n.active_connections == 0) {
            let better = match best {
                None => true,
                Some(current) => {
                    (node.weight, node.total_requests) < (current.weight, current.total_requests)
                }
            };
            if better {
                best = Some(node);
            }
        }

        best.map(|node| node.id.clone())
    }

    async fn scale_up(&self, reason: String) -> Result<ScalingDecision> {
        info!("Scaling up: {}", reason);

        let node = match self.provisioner.provision().await {
            Ok(node) => node,
            Err(e) => {
                error!("Failed to provision node: {}", e);
                self.publish(ScalingEvent::ScalingFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let node_id = node.id.clone();
        if let Err(e) = self.balancer.add_node(node.id, node.pool.clone(), node.weight) {
            error!("Failed to register provisioned node {}: {}", node_id, e);
            if let Err(shutdown_error) = node.pool.shutdown().await {
                warn!("Failed to release unregistered node {}: {}", node_id, shutdown_error);
            }
            self.publish(ScalingEvent::ScalingFailed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        self.publish(ScalingEvent::ScaledUp {
            node_id: node_id.clone(),
            reason: reason.clone(),
        });

        Ok(ScalingDecision::ScaleUp { node_id, reason })
    }

    async fn scale_down(&self, node_id: String) -> Result<ScalingDecision> {
        info!("Scaling down: removing node {}", node_id);

        match self.balancer.remove_node(&node_id).await {
            Ok(()) => {}
            Err(e @ Error::NodeShutdown(_)) => {
                // The node is out of the registry regardless
                error!("Scale-down of node {} left its pool running: {}", node_id, e);
            }
            Err(e) => {
                self.publish(ScalingEvent::ScalingFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        }

        self.publish(ScalingEvent::ScaledDown {
            node_id: node_id.clone(),
        });

        Ok(ScalingDecision::ScaleDown { node_id })
    }

    /// Starts the evaluation loop. Does nothing if disabled or already started.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.enabled {
            return;
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let scaler = Arc::downgrade(self);
        *task = Some(BackgroundTask::spawn(
            "dynamic-scaler",
            self.settings.evaluation_interval(),
            move || {
                let scaler = scaler.clone();
                async move {
                    if let Some(scaler) = scaler.upgrade() {
                        if let Err(e) = scaler.evaluate().await {
                            warn!("Scaling evaluation failed: {}", e);
                        }
                    }
                }
            },
        ));

        info!(
            "Dynamic scaler started with interval {:?}",
            self.settings.evaluation_interval()
        );
    }

    /// Stops the evaluation loop
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            info!("Dynamic scaler stopped");
        }
    }
}

fn mean_of(nodes: &[NodeStats], value: impl Fn(&NodeStats) -> f64) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    nodes.iter().map(value).sum::<f64>() / nodes.len() as f64
}
