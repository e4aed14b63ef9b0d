//! Routing interface consumed by the queue manager

use async_trait::async_trait;

use common::error::Result;
use common::types::{WorkItem, WorkOutput};

/// Something that can route a work item to a node and return its result
#[async_trait]
pub trait RequestRouter: Send + Sync {
    /// Routes one work item
    async fn route_request(&self, item: WorkItem) -> Result<WorkOutput>;
}
