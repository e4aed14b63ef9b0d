//! Common utilities and types for the inference dispatcher
//!
//! This crate provides shared functionality used across the dispatcher,
//! including error types, the work item model, node bookkeeping models,
//! and utility functions.

pub mod error;
pub mod models;
pub mod task;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, NodeShutdownFailure, Result};
pub use models::*;
pub use task::BackgroundTask;
pub use types::*;
