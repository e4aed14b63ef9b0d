//! Priority scheduling in front of the load balancer
//!
//! Work items are queued per priority, short-circuited through the request
//! cache when an identical payload already completed, and dispatched to a
//! [`scaling_adapter::RequestRouter`] with timeout and retry handling.

mod cache;
mod manager;
mod queue;

pub use cache::{CacheStats, RequestCache};
pub use manager::{QueueManager, WorkHandle};
pub use queue::PriorityQueue;
