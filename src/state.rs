//! Lifecycle state of the dispatcher
//!
//! The orchestrator moves `Created -> Starting -> Running -> Stopping ->
//! Stopped`. A failed start lands in `Failed`, from which only a stop is
//! allowed.

use std::fmt;

use serde::{Deserialize, Serialize};

use common::error::{Error, Result};

/// Current lifecycle state of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Components are wired but nothing runs yet
    Created,

    /// Background loops are starting
    Starting,

    /// Accepting and dispatching work
    Running,

    /// Draining and shutting components down
    Stopping,

    /// Fully stopped
    Stopped,

    /// Start-up failed
    Failed(String),
}

impl OrchestratorState {
    /// Returns true while work is accepted
    pub fn is_running(&self) -> bool {
        matches!(self, OrchestratorState::Running)
    }

    /// Returns true once stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, OrchestratorState::Stopped)
    }

    /// Gets the failure reason, if start-up failed
    pub fn failure(&self) -> Option<&str> {
        match self {
            OrchestratorState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true if `next` may follow this state
    pub fn can_transition_to(&self, next: &OrchestratorState) -> bool {
        use OrchestratorState::*;

        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Failed(_))
                | (Running, Stopping)
                | (Failed(_), Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: OrchestratorState) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(Error::InvalidArgument(format!(
                "Cannot move from {} to {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

impl Default for OrchestratorState {
    fn default() -> Self {
        OrchestratorState::Created
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Created => write!(f, "created"),
            OrchestratorState::Starting => write!(f, "starting"),
            OrchestratorState::Running => write!(f, "running"),
            OrchestratorState::Stopping => write!(f, "stopping"),
            OrchestratorState::Stopped => write!(f, "stopped"),
            OrchestratorState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
