//! Node selection strategies
//!
//! Each strategy is a pure function over the eligible candidates, returning
//! the index of the chosen one. Ties always resolve to the first candidate
//! in registration order.

use std::sync::atomic::{AtomicUsize, Ordering};

use common::models::{NodeHealth, NodeMetrics, ResourceSnapshot};
use common::types::{Strategy, WorkItem};
use worker_pool::PoolStats;

/// Latency at which the resource-aware latency term reaches zero
const LATENCY_CEILING_MS: f64 = 5_000.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time view of an eligible node
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Node identifier
    pub id: String,

    /// Routing weight
    pub weight: f64,

    /// Health at selection time
    pub health: NodeHealth,

    /// Metrics at selection time
    pub metrics: NodeMetrics,

    /// Worker pool counters at selection time
    pub pool: PoolStats,

    /// Whether the node can serve accelerator work
    pub accelerator: bool,
}

impl Candidate {
    /// Weighted load score, lower is less loaded
    pub fn load_score(&self) -> f64 {
        0.4 * self.metrics.cpu_utilization
            + 0.3 * self.metrics.memory_utilization
            + 0.2 * self.pool.worker_utilization()
            + 0.1 * self.metrics.error_rate
    }

    /// Unused CPU share (0.0-1.0)
    pub fn cpu_headroom(&self) -> f64 {
        (1.0 - self.metrics.cpu_utilization).max(0.0)
    }

    /// Estimated memory available to this node.
    ///
    /// The host's free memory is split by routing weight; the part held by
    /// busy workers is considered reserved.
    pub fn memory_share(&self, resources: &ResourceSnapshot, total_weight: f64) -> u64 {
        if total_weight <= 0.0 {
            return 0;
        }
        let share = self.weight / total_weight;
        let idle = 1.0 - self.pool.worker_utilization();
        (resources.available_memory_bytes as f64 * share * idle) as u64
    }

    /// Resource match score for the resource-aware strategy, higher is better
    pub fn resource_match_score(&self, memory_headroom_bytes: Option<u64>) -> f64 {
        let memory_gb = memory_headroom_bytes.map_or(0.0, |b| b as f64 / BYTES_PER_GB);
        let latency_term = (1.0 - self.metrics.average_latency_ms / LATENCY_CEILING_MS).max(0.0);

        0.3 * self.cpu_headroom()
            + 0.3 * memory_gb
            + 0.2 * latency_term
            + 0.2 * (f64::from(self.health.score) / 100.0)
    }

    /// Returns true if the node can cover `item`'s requirement
    fn satisfies(&self, item: &WorkItem, memory_headroom_bytes: Option<u64>) -> bool {
        let requirement = item.requirement();

        if requirement.accelerator && !self.accelerator {
            return false;
        }
        if self.cpu_headroom() < requirement.cpu {
            return false;
        }
        // Without a resource snapshot memory headroom is unknown, not exhausted
        memory_headroom_bytes.map_or(true, |available| available >= requirement.memory_bytes)
    }
}

/// Picks a candidate for `item` under `strategy`.
///
/// Returns `None` only when `candidates` is empty.
pub fn select(
    strategy: Strategy,
    candidates: &[Candidate],
    item: &WorkItem,
    cursor: &AtomicUsize,
    resources: Option<&ResourceSnapshot>,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        Strategy::RoundRobin => round_robin(candidates, cursor),
        Strategy::LeastLoaded => least_loaded(candidates),
        Strategy::ResourceAware => resource_aware(candidates, item, resources),
        Strategy::PriorityBased => priority_based(candidates, item),
    }
}

/// Cyclic cursor over the candidates
pub fn round_robin(candidates: &[Candidate], cursor: &AtomicUsize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    Some(cursor.fetch_add(1, Ordering::SeqCst) % candidates.len())
}

/// Candidate with the lowest weighted load
pub fn least_loaded(candidates: &[Candidate]) -> Option<usize> {
    argmin_by(candidates, Candidate::load_score)
}

/// Candidate with the best resource match among those covering the
/// requirement, falling back to least-loaded when none does
pub fn resource_aware(
    candidates: &[Candidate],
    item: &WorkItem,
    resources: Option<&ResourceSnapshot>,
) -> Option<usize> {
    let total_weight: f64 = candidates.iter().map(|c| c.weight).sum();

    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let memory_headroom = resources.map(|r| candidate.memory_share(r, total_weight));
        if !candidate.satisfies(item, memory_headroom) {
            continue;
        }
        let score = candidate.resource_match_score(memory_headroom);
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }

    match best {
        Some((index, _)) => Some(index),
        None => least_loaded(candidates),
    }
}

/// Lowest-latency candidate for urgent work, least-loaded otherwise
pub fn priority_based(candidates: &[Candidate], item: &WorkItem) -> Option<usize> {
    if item.priority().is_urgent() {
        argmin_by(candidates, |c| c.metrics.average_latency_ms)
    } else {
        least_loaded(candidates)
    }
}

fn argmin_by(candidates: &[Candidate], key: impl Fn(&Candidate) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let value = key(candidate);
        if best.map_or(true, |(_, best_value)| value < best_value) {
            best = Some((index, value));
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{Priority, ResourceRequirement};
    use serde_json::json;

    fn candidate(id: &str, cpu: f64, memory: f64, latency_ms: f64) -> Candidate {
        Candidate {
            id: id.to_string(),
            weight: 1.0,
            health: NodeHealth::full(),
            metrics: NodeMetrics {
                cpu_utilization: cpu,
                memory_utilization: memory,
                average_latency_ms: latency_ms,
                ..Default::default()
            },
            pool: PoolStats {
                total_workers: 4,
                ..Default::default()
            },
            accelerator: false,
        }
    }

    fn item() -> WorkItem {
        WorkItem::new(json!({}))
    }

    #[test]
    fn test_round_robin_cycles() {
        let candidates = vec![
            candidate("a", 0.0, 0.0, 0.0),
            candidate("b", 0.0, 0.0, 0.0),
            candidate("c", 0.0, 0.0, 0.0),
        ];
        let cursor = AtomicUsize::new(0);

        let picks: Vec<usize> = (0..6)
            .map(|_| round_robin(&candidates, &cursor).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_loaded_uses_weighted_formula() {
        let mut busy_workers = candidate("a", 0.2, 0.2, 0.0);
        busy_workers.pool.active_workers = 4;
        let candidates = vec![
            busy_workers,
            candidate("b", 0.5, 0.1, 0.0),
            candidate("c", 0.3, 0.3, 0.0),
        ];

        // a = 0.08 + 0.06 + 0.2, b = 0.2 + 0.03, c = 0.12 + 0.09
        assert_eq!(least_loaded(&candidates), Some(2));
    }

    #[test]
    fn test_least_loaded_ties_go_to_first() {
        let candidates = vec![
            candidate("a", 0.5, 0.5, 0.0),
            candidate("b", 0.1, 0.1, 0.0),
            candidate("c", 0.1, 0.1, 0.0),
        ];

        assert_eq!(least_loaded(&candidates), Some(1));
    }

    #[test]
    fn test_resource_aware_prefers_headroom() {
        let candidates = vec![
            candidate("a", 0.8, 0.0, 0.0),
            candidate("b", 0.1, 0.0, 0.0),
        ];
        let snapshot = ResourceSnapshot::new(16 << 30, 8 << 30, 0.5);
        let item = item().with_requirement(ResourceRequirement::new(0.5, 1 << 30));

        assert_eq!(resource_aware(&candidates, &item, Some(&snapshot)), Some(1));
    }

    #[test]
    fn test_resource_aware_falls_back_to_least_loaded() {
        let candidates = vec![
            candidate("a", 0.6, 0.6, 0.0),
            candidate("b", 0.5, 0.2, 0.0),
        ];
        let snapshot = ResourceSnapshot::new(16 << 30, 1 << 30, 0.5);
        let item = item().with_requirement(ResourceRequirement::new(0.1, 4 << 30));

        assert_eq!(resource_aware(&candidates, &item, Some(&snapshot)), Some(1));
    }

    #[test]
    fn test_memory_share_follows_weight_and_busy_workers() {
        let snapshot = ResourceSnapshot::new(16 << 30, 8 << 30, 0.5);

        let light = candidate("a", 0.0, 0.0, 0.0);
        let mut heavy = candidate("b", 0.0, 0.0, 0.0);
        heavy.weight = 3.0;
        assert_eq!(light.memory_share(&snapshot, 4.0), 2 << 30);
        assert_eq!(heavy.memory_share(&snapshot, 4.0), 6 << 30);

        let mut busy = candidate("c", 0.0, 0.0, 0.0);
        busy.pool.active_workers = 2;
        assert_eq!(busy.memory_share(&snapshot, 2.0), 2 << 30);
        assert_eq!(busy.memory_share(&snapshot, 0.0), 0);
    }

    #[test]
    fn test_resource_aware_prefers_idle_node_memory() {
        let mut busy = candidate("a", 0.2, 0.0, 0.0);
        busy.pool.active_workers = 4;
        let candidates = vec![busy, candidate("b", 0.2, 0.0, 0.0)];
        let snapshot = ResourceSnapshot::new(16 << 30, 8 << 30, 0.5);
        let item = item().with_requirement(ResourceRequirement::new(0.1, 0));

        assert_eq!(resource_aware(&candidates, &item, Some(&snapshot)), Some(1));
    }

    #[test]
    fn test_resource_aware_requires_accelerator() {
        let mut gpu = candidate("gpu", 0.9, 0.0, 0.0);
        gpu.accelerator = true;
        let candidates = vec![candidate("cpu", 0.0, 0.0, 0.0), gpu];
        let item = item().with_requirement(ResourceRequirement::new(0.05, 0).with_accelerator());

        assert_eq!(resource_aware(&candidates, &item, None), Some(1));
    }

    #[test]
    fn test_priority_based_routes_urgent_work_to_fastest() {
        let candidates = vec![
            candidate("a", 0.0, 0.0, 400.0),
            candidate("b", 0.9, 0.9, 50.0),
        ];

        let urgent = item().with_priority(Priority::High);
        assert_eq!(priority_based(&candidates, &urgent), Some(1));

        let routine = item().with_priority(Priority::Low);
        assert_eq!(priority_based(&candidates, &routine), Some(0));
    }

    #[test]
    fn test_select_on_empty_set() {
        let cursor = AtomicUsize::new(0);
        for strategy in Strategy::ALL {
            assert_eq!(select(strategy, &[], &item(), &cursor, None), None);
        }
    }
}
