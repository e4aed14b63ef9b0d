//! Dispatcher error taxonomy
//!
//! Shared by every crate of the workspace. Routing, health and shutdown failures have dedicated variants
//! so callers can match on them instead of parsing messages.

use std::fmt;
use thiserror::Error;

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// A single node whose worker pool failed to shut down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeShutdownFailure {
    /// Node identifier
    pub node_id: String,
    /// Failure reason reported by the worker pool
    pub reason: String,
}

impl fmt::Display for NodeShutdownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node_id, self.reason)
    }
}

/// Common error type for dispatcher operations
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem or socket failure
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A payload or output could not be (de)serialized
    #[error("Malformed JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Settings failed to load or validate
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A worker pool or the host ran out of capacity
    #[error("Resource unavailable: {0}")]
    Resource(String),

    /// No node is currently eligible for routing
    #[error("No healthy nodes available")]
    NoHealthyNodes,

    /// One or more worker pools failed to shut down
    #[error("{} node(s) failed to shut down: {}", .0.len(), format_failures(.0))]
    NodeShutdown(Vec<NodeShutdownFailure>),

    /// A node health check failed
    #[error("Health check failed for node {node_id}: {reason}")]
    HealthCheck {
        /// Node identifier
        node_id: String,
        /// Failure reason
        reason: String,
    },

    /// A worker pool failed to execute a work item
    #[error("Request execution failed on node {node_id}: {reason}")]
    RequestExecution {
        /// Node identifier
        node_id: String,
        /// Failure reason
        reason: String,
    },

    /// The work queue is at capacity
    #[error("Queue is full (capacity {0})")]
    QueueFull(usize),

    /// The operation was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unknown node, work item or configuration key
    #[error("{0} not found")]
    NotFound(String),

    /// A node with the same identifier is registered
    #[error("{0} is already registered")]
    AlreadyExists(String),

    /// Rejected input or lifecycle transition
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Unexpected failure inside a component
    #[error("Internal failure: {0}")]
    Internal(String),
}

fn format_failures(failures: &[NodeShutdownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Creates a request execution error for a node
    pub fn request_execution(node_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::RequestExecution {
            node_id: node_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a health check error for a node
    pub fn health_check(node_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::HealthCheck {
            node_id: node_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for an unknown node, item or key
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true for a duplicate node registration
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Returns true if routing failed because no node was eligible
    pub fn is_no_healthy_nodes(&self) -> bool {
        matches!(self, Error::NoHealthyNodes)
    }

    /// Returns true when a bounded wait elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Returns true if a caller may resubmit the work item.
    ///
    /// Execution failures, timeouts and an empty eligible set are transient;
    /// everything else points at the request or the dispatcher itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RequestExecution { .. } | Error::Timeout(_) | Error::NoHealthyNodes
        )
    }

    /// Returns the per-node failures of a shutdown error
    pub fn shutdown_failures(&self) -> &[NodeShutdownFailure] {
        match self {
            Error::NodeShutdown(failures) => failures,
            _ => &[],
        }
    }
}
