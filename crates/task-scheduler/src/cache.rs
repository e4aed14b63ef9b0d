//! Request cache
//!
//! Completed outputs keyed by a SHA-256 digest of the work item's payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::trace;

use common::types::{WorkItem, WorkOutput};
use orchestrator_config::CacheSettings;

#[derive(Debug, Clone)]
struct CacheEntry {
    output: WorkOutput,
    inserted_at: Instant,
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed or found an expired entry
    pub misses: u64,
}

/// TTL and size bounded cache of work outputs
pub struct RequestCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RequestCache {
    /// Creates an empty cache
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a cache from settings, or `None` when caching is disabled
    pub fn from_settings(settings: &CacheSettings) -> Option<Self> {
        settings
            .enabled
            .then(|| Self::new(settings.max_entries, settings.ttl()))
    }

    /// Cache key of `item`: hex SHA-256 of its serialized payload
    pub fn key_for(item: &WorkItem) -> String {
        let mut hasher = Sha256::new();
        hasher.update(item.payload().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Looks up a live output
    pub fn get(&self, key: &str) -> Option<WorkOutput> {
        let mut entries = self.entries.lock();

        let output = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.output.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };

        if output.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!("Cache hit for {}", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        output
    }

    /// Stores `output` under `key`, evicting the oldest entry when full
    pub fn insert(&self, key: String, output: WorkOutput) {
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                output,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drops every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, expired ones included until touched
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
