//! Common types for the inference dispatcher
//!
//! This module defines the unit of routable work and its scheduling
//! attributes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work item identifier
pub type WorkItemId = String;

/// Result value produced by a worker pool for a work item
pub type WorkOutput = serde_json::Value;

/// Work item priority. Lower levels are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Critical priority
    Critical = 0,
    /// High priority
    High = 1,
    /// Normal priority
    Normal = 2,
    /// Low priority
    Low = 3,
}

impl Priority {
    /// All priority levels, most urgent first
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Numeric level, 0 being the most urgent
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Returns true for the two most urgent levels
    pub fn is_urgent(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Priority::Critical),
            "high" | "1" => Ok(Priority::High),
            "normal" | "2" => Ok(Priority::Normal),
            "low" | "3" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Node selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cycle through eligible nodes in registration order
    RoundRobin,
    /// Pick the node with the lowest weighted load
    LeastLoaded,
    /// Pick the node with the best resource headroom for the item
    ResourceAware,
    /// Favour low latency for urgent work, least-loaded otherwise
    PriorityBased,
}

impl Strategy {
    /// Candidate set evaluated by adaptive switching, in tie-break order
    pub const ALL: [Strategy; 4] = [
        Strategy::RoundRobin,
        Strategy::LeastLoaded,
        Strategy::ResourceAware,
        Strategy::PriorityBased,
    ];
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round-robin"),
            Strategy::LeastLoaded => write!(f, "least-loaded"),
            Strategy::ResourceAware => write!(f, "resource-aware"),
            Strategy::PriorityBased => write!(f, "priority-based"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least-loaded" | "leastloaded" => Ok(Strategy::LeastLoaded),
            "resource-aware" | "resourceaware" => Ok(Strategy::ResourceAware),
            "priority-based" | "prioritybased" => Ok(Strategy::PriorityBased),
            _ => Err(format!("Unknown strategy: {}", s)),
        }
    }
}

/// Resource requirement of a work item
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// CPU share required, as a fraction of one node (0.0-1.0)
    pub cpu: f64,
    /// Memory required in bytes
    pub memory_bytes: u64,
    /// Whether an accelerator is required
    #[serde(default)]
    pub accelerator: bool,
}

impl ResourceRequirement {
    /// Creates a CPU and memory requirement without an accelerator
    pub fn new(cpu: f64, memory_bytes: u64) -> Self {
        Self {
            cpu,
            memory_bytes,
            accelerator: false,
        }
    }

    /// Marks the requirement as needing an accelerator
    pub fn with_accelerator(mut self) -> Self {
        self.accelerator = true;
        self
    }
}

/// A unit of routable work.
///
/// Every attribute is fixed at construction; only the retry counter moves,
/// through [`WorkItem::record_retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    id: WorkItemId,
    priority: Priority,
    requirement: ResourceRequirement,
    timeout: Option<Duration>,
    retry_budget: u32,
    retries: u32,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Creates a normal-priority work item with a generated identifier
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: Priority::Normal,
            requirement: ResourceRequirement::default(),
            timeout: None,
            retry_budget: 0,
            retries: 0,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Sets an explicit identifier
    pub fn with_id(mut self, id: impl Into<WorkItemId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the resource requirement
    pub fn with_requirement(mut self, requirement: ResourceRequirement) -> Self {
        self.requirement = requirement;
        self
    }

    /// Sets the execution timeout enforced by the queue manager
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how many times the item may be resubmitted after a failure
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Gets the identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Gets the resource requirement
    pub fn requirement(&self) -> &ResourceRequirement {
        &self.requirement
    }

    /// Gets the timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Gets the retry budget
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Gets the number of retries consumed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Gets the remaining retries
    pub fn retries_remaining(&self) -> u32 {
        self.retry_budget.saturating_sub(self.retries)
    }

    /// Gets the payload
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Gets the creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Consumes one retry. Returns false when the budget is exhausted.
    pub fn record_retry(&mut self) -> bool {
        if self.retries >= self.retry_budget {
            return false;
        }
        self.retries += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Critical.is_urgent());
        assert!(Priority::High.is_urgent());
        assert!(!Priority::Normal.is_urgent());
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.to_string().parse::<Strategy>(), Ok(strategy));
        }
        assert_eq!("least_loaded".parse::<Strategy>(), Ok(Strategy::LeastLoaded));
    }

    #[test]
    fn test_retry_budget() {
        let mut item = WorkItem::new(json!({"prompt": "hi"})).with_retry_budget(2);

        assert!(item.record_retry());
        assert!(item.record_retry());
        assert!(!item.record_retry());
        assert_eq!(item.retries(), 2);
        assert_eq!(item.retries_remaining(), 0);
    }

    #[test]
    fn test_builder_keeps_attributes() {
        let item = WorkItem::new(json!(1))
            .with_id("job-1")
            .with_priority(Priority::Critical)
            .with_requirement(ResourceRequirement::new(0.5, 1024).with_accelerator())
            .with_timeout(Duration::from_secs(3));

        assert_eq!(item.id(), "job-1");
        assert_eq!(item.priority(), Priority::Critical);
        assert!(item.requirement().accelerator);
        assert_eq!(item.timeout(), Some(Duration::from_secs(3)));
    }
}
