//! Fixed snapshot resource source

use async_trait::async_trait;
use parking_lot::RwLock;

use common::error::Result;
use common::models::ResourceSnapshot;

use crate::ResourceManager;

/// Resource manager that serves a caller-controlled snapshot
#[derive(Debug)]
pub struct StaticResourceManager {
    snapshot: RwLock<ResourceSnapshot>,
}

impl StaticResourceManager {
    /// Creates a source serving `snapshot`
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Replaces the served snapshot
    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

#[async_trait]
impl ResourceManager for StaticResourceManager {
    async fn get_current_resources(&self) -> Result<ResourceSnapshot> {
        Ok(self.snapshot.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_latest_snapshot() {
        let source = StaticResourceManager::new(ResourceSnapshot::new(100, 50, 0.2));
        assert_eq!(source.get_current_resources().await.unwrap().available_memory_bytes, 50);

        source.set(ResourceSnapshot::new(100, 10, 0.9));
        let snapshot = source.get_current_resources().await.unwrap();
        assert_eq!(snapshot.available_memory_bytes, 10);
        assert_eq!(snapshot.cpu_utilization, 0.9);
    }
}
