//! Adaptive strategy selection
//!
//! The adaptive wrapper scores the active strategy at every evaluation tick
//! and keeps a short rolling window of scores per strategy. When the active
//! strategy's average drops below the switch threshold, or an exploration
//! draw fires, it switches to the strategy with the best average. Strategies
//! that were never scored count as exactly the threshold.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::error::Result;
use common::task::BackgroundTask;
use common::types::{Strategy, WorkItem, WorkOutput};
use common::utils::clamp_unit;
use orchestrator_config::AdaptiveSettings;

use crate::balancer::LoadBalancer;
use crate::router::RequestRouter;
use crate::stats::BalancerStats;

/// Maximum number of scores kept per strategy
pub const PERFORMANCE_WINDOW: usize = 10;

/// Performance score of a strategy over an evaluation interval (0.0-1.0).
///
/// Latency and throughput are normalized against the caps in `settings`.
pub fn performance_score(
    settings: &AdaptiveSettings,
    average_latency_ms: f64,
    error_rate: f64,
    throughput_per_minute: f64,
) -> f64 {
    let latency = normalize(average_latency_ms, settings.latency_cap_ms);
    let throughput = normalize(throughput_per_minute, settings.throughput_cap_per_minute);

    0.4 * (1.0 - latency) + 0.4 * (1.0 - clamp_unit(error_rate)) + 0.2 * throughput
}

fn normalize(value: f64, cap: f64) -> f64 {
    if cap <= 0.0 {
        return 0.0;
    }
    clamp_unit(value / cap)
}

/// Bounded FIFO window of performance scores
#[derive(Debug, Clone)]
pub struct PerformanceWindow {
    scores: VecDeque<f64>,
    capacity: usize,
}

impl PerformanceWindow {
    /// Creates an empty window holding at most `capacity` scores
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, PERFORMANCE_WINDOW);
        Self {
            scores: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a score, evicting the oldest when full
    pub fn push(&mut self, score: f64) {
        if self.scores.len() == self.capacity {
            self.scores.pop_front();
        }
        self.scores.push_back(score);
    }

    /// Average score, `None` if nothing was recorded
    pub fn average(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }

    /// Number of recorded scores
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Returns true if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Recorded scores, oldest first
    pub fn scores(&self) -> Vec<f64> {
        self.scores.iter().copied().collect()
    }
}

/// Request counters at the previous evaluation
#[derive(Debug, Clone, Copy)]
struct Baseline {
    at: Instant,
    total_requests: u64,
    total_errors: u64,
}

/// Load balancer wrapper that switches strategies based on observed performance
pub struct AdaptiveLoadBalancer {
    /// Wrapped load balancer
    balancer: Arc<LoadBalancer>,

    /// Adaptive settings
    settings: AdaptiveSettings,

    /// Score windows per strategy
    windows: Mutex<HashMap<Strategy, PerformanceWindow>>,

    /// Counters at the previous evaluation
    baseline: Mutex<Baseline>,

    /// Evaluation loop, present while started
    evaluation_task: Mutex<Option<BackgroundTask>>,
}

impl AdaptiveLoadBalancer {
    /// Wraps `balancer`
    pub fn new(balancer: Arc<LoadBalancer>, settings: AdaptiveSettings) -> Self {
        let stats = balancer.get_stats();

        Self {
            balancer,
            settings,
            windows: Mutex::new(HashMap::new()),
            baseline: Mutex::new(Baseline {
                at: Instant::now(),
                total_requests: stats.total_requests,
                total_errors: stats.total_errors,
            }),
            evaluation_task: Mutex::new(None),
        }
    }

    /// Gets the wrapped load balancer
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Routes a work item through the wrapped balancer
    pub async fn route_request(&self, item: WorkItem) -> Result<WorkOutput> {
        self.balancer.route_request(item).await
    }

    /// Gets the wrapped balancer's statistics
    pub fn get_stats(&self) -> BalancerStats {
        self.balancer.get_stats()
    }

    /// Gets the recorded scores per strategy
    pub fn performance_history(&self) -> HashMap<Strategy, Vec<f64>> {
        self.windows
            .lock()
            .iter()
            .map(|(strategy, window)| (*strategy, window.scores()))
            .collect()
    }

    /// Scores the active strategy over the interval since the previous
    /// evaluation and switches if warranted.
    ///
    /// Returns the strategy chosen by a switch decision, which may be the
    /// active one if it still scores best.
    pub fn evaluate(&self) -> Option<Strategy> {
        let stats = self.balancer.get_stats();
        let now = Instant::now();

        let (throughput_per_minute, error_rate) = {
            let mut baseline = self.baseline.lock();
            let requests = stats.total_requests.saturating_sub(baseline.total_requests);
            let errors = stats.total_errors.saturating_sub(baseline.total_errors);
            let minutes = now.saturating_duration_since(baseline.at).as_secs_f64() / 60.0;

            *baseline = Baseline {
                at: now,
                total_requests: stats.total_requests,
                total_errors: stats.total_errors,
            };

            let throughput = if minutes > 0.0 { requests as f64 / minutes } else { 0.0 };
            let error_rate = if requests > 0 { errors as f64 / requests as f64 } else { 0.0 };
            (throughput, error_rate)
        };

        let score = performance_score(
            &self.settings,
            stats.average_latency,
            error_rate,
            throughput_per_minute,
        );

        debug!(
            "Strategy {} scored {:.3} (latency {:.1}ms, error rate {:.3}, {:.1} req/min)",
            stats.strategy, score, stats.average_latency, error_rate, throughput_per_minute
        );

        self.record_evaluation(score)
    }

    /// Records a score for the active strategy and applies the switch rule
    pub fn record_evaluation(&self, score: f64) -> Option<Strategy> {
        let current = self.balancer.strategy();

        let (average, best) = {
            let mut windows = self.windows.lock();
            let window = windows
                .entry(current)
                .or_insert_with(|| PerformanceWindow::new(self.settings.window_size));
            window.push(score);
            let average = window.average().unwrap_or(score);
            (average, self.best_strategy(&windows))
        };

        let underperforming = average < self.settings.switch_threshold;
        let exploring = !underperforming && self.explore();
        if !underperforming && !exploring {
            return None;
        }

        if best != current {
            if underperforming {
                warn!(
                    "Strategy {} underperforming (average {:.3}), switching to {}",
                    current, average, best
                );
            } else {
                info!("Exploring strategy {} in place of {}", best, current);
            }
            self.balancer.update_strategy(best);
        } else {
            debug!("Strategy {} remains the best candidate (average {:.3})", current, average);
        }

        Some(best)
    }

    fn explore(&self) -> bool {
        self.settings.exploration_rate > 0.0
            && rand::thread_rng().gen::<f64>() < self.settings.exploration_rate
    }

    fn best_strategy(&self, windows: &HashMap<Strategy, PerformanceWindow>) -> Strategy {
        let prior = self.settings.switch_threshold;
        let mut best = (Strategy::ALL[0], f64::MIN);

        for strategy in Strategy::ALL {
            let average = windows
                .get(&strategy)
                .and_then(PerformanceWindow::average)
                .unwrap_or(prior);
            if average > best.1 {
                best = (strategy, average);
            }
        }

        best.0
    }

    /// Starts the balancer's health checks and the evaluation loop
    pub fn start(self: &Arc<Self>) {
        self.balancer.start_health_checks();

        if !self.settings.enabled {
            return;
        }

        let mut task = self.evaluation_task.lock();
        if task.is_some() {
            return;
        }

        let adaptive = Arc::downgrade(self);
        *task = Some(BackgroundTask::spawn(
            "strategy-evaluation",
            self.settings.evaluation_interval(),
            move || {
                if let Some(adaptive) = adaptive.upgrade() {
                    adaptive.evaluate();
                }
                async {}
            },
        ));

        info!(
            "Adaptive strategy evaluation started with interval {:?}",
            self.settings.evaluation_interval()
        );
    }

    /// Stops the evaluation loop
    pub async fn stop_evaluation(&self) {
        let task = self.evaluation_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Stops evaluation, then shuts the wrapped balancer down
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_evaluation().await;
        self.balancer.shutdown().await
    }
}

#[async_trait]
impl RequestRouter for AdaptiveLoadBalancer {
    async fn route_request(&self, item: WorkItem) -> Result<WorkOutput> {
        self.balancer.route_request(item).await
    }
}
