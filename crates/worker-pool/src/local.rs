//! In-process worker pool
//!
//! Runs a caller-supplied async handler on a fixed number of worker slots.
//! Slots are semaphore permits; a request waits for a free slot, runs, and
//! releases it even if the caller drops the request future.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::types::{WorkItem, WorkOutput};

use crate::{PoolStats, WorkerPool};

type Handler = Arc<dyn Fn(WorkItem) -> BoxFuture<'static, Result<WorkOutput>> + Send + Sync>;

/// Default time allowed for in-flight work to finish on shutdown
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared counters of a local pool
#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    active: AtomicUsize,
}

/// Marks a request finished when dropped
struct Completion<'a> {
    counters: &'a Counters,
    running: bool,
}

impl<'a> Completion<'a> {
    fn new(counters: &'a Counters) -> Self {
        counters.total.fetch_add(1, Ordering::SeqCst);
        Self {
            counters,
            running: false,
        }
    }

    fn start(&mut self) {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        self.running = true;
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if self.running {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Worker pool executing work items in the current process
pub struct LocalWorkerPool {
    /// Pool name, used in logs
    name: String,

    /// Work item handler
    handler: Handler,

    /// Worker slots
    slots: Arc<Semaphore>,

    /// Number of worker slots
    workers: usize,

    /// Request counters
    counters: Counters,

    /// Cleared once shutdown starts
    accepting: AtomicBool,

    /// Whether the pool can serve accelerator work
    accelerator: bool,

    /// Time allowed for in-flight work on shutdown
    drain_timeout: Duration,
}

impl LocalWorkerPool {
    /// Creates a pool with `workers` slots running `handler`
    pub fn new<F, Fut>(name: impl Into<String>, workers: usize, handler: F) -> Self
    where
        F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkOutput>> + Send + 'static,
    {
        let name = name.into();
        let workers = workers.max(1);

        debug!("Created worker pool {} with {} workers", name, workers);

        Self {
            name,
            handler: Arc::new(move |item| handler(item).boxed()),
            slots: Arc::new(Semaphore::new(workers)),
            workers,
            counters: Counters::default(),
            accepting: AtomicBool::new(true),
            accelerator: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Marks the pool as able to serve accelerator work
    pub fn with_accelerator(mut self, accelerator: bool) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Sets the time allowed for in-flight work on shutdown
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Gets the pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true until shutdown starts
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> Error {
        Error::Resource(format!("Worker pool {} is shut down", self.name))
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn process_request(&self, item: WorkItem) -> Result<WorkOutput> {
        if !self.is_accepting() {
            return Err(self.closed_error());
        }

        let mut completion = Completion::new(&self.counters);

        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| self.closed_error())?;

        completion.start();
        (self.handler)(item).await
    }

    fn get_stats(&self) -> PoolStats {
        PoolStats {
            total_requests: self.counters.total.load(Ordering::SeqCst),
            completed_requests: self.counters.completed.load(Ordering::SeqCst),
            active_workers: self.counters.active.load(Ordering::SeqCst),
            total_workers: self.workers,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let all_slots = u32::try_from(self.workers).map_err(|_| {
            Error::Config(format!(
                "Worker pool {} has {} workers, more than can be drained at once",
                self.name, self.workers
            ))
        })?;

        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down worker pool {}", self.name);

        // Holding every slot means no request is running or waiting ahead of us
        let drained = tokio::time::timeout(
            self.drain_timeout,
            self.slots.acquire_many(all_slots),
        )
        .await;
        self.slots.close();

        match drained {
            Ok(_) => {
                info!("Worker pool {} shut down", self.name);
                Ok(())
            }
            Err(_) => {
                let active = self.counters.active.load(Ordering::SeqCst);
                warn!(
                    "Worker pool {} shut down with {} requests still running",
                    self.name, active
                );
                Err(Error::Timeout(format!(
                    "Worker pool {} did not drain within {:?} ({} active)",
                    self.name, self.drain_timeout, active
                )))
            }
        }
    }

    async fn health_probe(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn supports_accelerator(&self) -> bool {
        self.accelerator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_pool(workers: usize) -> LocalWorkerPool {
        LocalWorkerPool::new("echo", workers, |item: WorkItem| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(item.payload().clone())
        })
    }

    #[tokio::test]
    async fn test_process_request_returns_handler_output() {
        let pool = echo_pool(2);
        let output = pool.process_request(WorkItem::new(json!({"x": 1}))).await.unwrap();

        assert_eq!(output, json!({"x": 1}));
        let stats = pool.get_stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.completed_requests, 1);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.total_workers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_bound_concurrency() {
        let pool = Arc::new(echo_pool(1));

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.process_request(WorkItem::new(json!(1))).await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.process_request(WorkItem::new(json!(2))).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = pool.get_stats();
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.waiting_requests(), 1);

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(pool.get_stats().completed_requests, 2);
    }

    #[tokio::test]
    async fn test_failures_count_as_completed() {
        let pool = LocalWorkerPool::new("failing", 1, |_item: WorkItem| async {
            Err(Error::Internal("model crashed".to_string()))
        });

        assert!(pool.process_request(WorkItem::new(json!(null))).await.is_err());
        assert_eq!(pool.get_stats().completed_requests, 1);
    }

    #[tokio::test]
    async fn test_rejects_work_after_shutdown() {
        let pool = echo_pool(2).with_accelerator(true);
        assert!(pool.supports_accelerator());

        pool.shutdown().await.unwrap();
        pool.shutdown().await.unwrap();

        assert!(pool.health_probe().await.is_err());
        assert!(matches!(
            pool.process_request(WorkItem::new(json!(1))).await,
            Err(Error::Resource(_))
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[tokio::test]
    async fn test_oversized_pool_refuses_shutdown() {
        let workers = u32::MAX as usize + 1;
        let pool = echo_pool(workers);

        let err = pool.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(pool.is_accepting());
        assert_eq!(pool.get_stats().total_workers, workers);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out_on_stuck_work() {
        let pool = Arc::new(
            LocalWorkerPool::new("stuck", 1, |_item: WorkItem| async {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(json!(null))
            })
            .with_drain_timeout(Duration::from_secs(1)),
        );

        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.process_request(WorkItem::new(json!(1))).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(pool.shutdown().await.unwrap_err().is_timeout());
        running.abort();
    }
}
