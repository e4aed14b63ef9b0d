//! Queue manager
//!
//! Accepts work items, orders them through the priority queue and hands them
//! to a router from a background dispatch loop. Each dispatch is bounded by
//! the item's timeout; retryable failures are put back on the queue while
//! the item still has retry budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use common::error::{Error, Result};
use common::types::{WorkItem, WorkItemId, WorkOutput};
use common::utils::execute_with_timeout;
use orchestrator_config::QueueSettings;
use performance_monitor::MetricsCollector;
use scaling_adapter::{BacklogSource, RequestRouter};

use crate::cache::{CacheStats, RequestCache};
use crate::queue::PriorityQueue;

/// Awaitable result of a submitted work item
#[derive(Debug)]
pub struct WorkHandle {
    id: WorkItemId,
    receiver: oneshot::Receiver<Result<WorkOutput>>,
}

impl WorkHandle {
    /// Identifier of the submitted work item
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the work item to finish
    pub async fn result(self) -> Result<WorkOutput> {
        let Self { id, receiver } = self;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled(format!("Work item {} was abandoned", id))),
        }
    }
}

/// Work item waiting for dispatch
struct Pending {
    item: WorkItem,
    responder: oneshot::Sender<Result<WorkOutput>>,
    submitted_at: Instant,
    cache_key: Option<String>,
}

impl Pending {
    fn respond(self, result: Result<WorkOutput>) {
        if self.responder.send(result).is_err() {
            trace!("Caller of work item {} is gone", self.item.id());
        }
    }
}

/// Dispatch slot held while a work item is routed
struct InFlight {
    _permit: OwnedSemaphorePermit,
    counter: Arc<AtomicUsize>,
}

impl InFlight {
    fn new(permit: OwnedSemaphorePermit, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            _permit: permit,
            counter,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Priority scheduler in front of a request router
pub struct QueueManager {
    router: Arc<dyn RequestRouter>,
    settings: QueueSettings,
    queue: Mutex<PriorityQueue<Pending>>,
    ready: Notify,
    slots: Arc<Semaphore>,
    dispatch_limit: u32,
    in_flight: Arc<AtomicUsize>,
    cache: Option<RequestCache>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Creates a stopped queue manager routing through `router`
    pub fn new(router: Arc<dyn RequestRouter>, settings: QueueSettings) -> Self {
        let dispatch_limit = u32::try_from(settings.max_concurrent_dispatches.max(1)).unwrap_or(u32::MAX);
        let queue = PriorityQueue::new(settings.max_queue_size, settings.starvation_threshold());

        Self {
            router,
            queue: Mutex::new(queue),
            ready: Notify::new(),
            slots: Arc::new(Semaphore::new(dispatch_limit as usize)),
            dispatch_limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            cache: None,
            metrics: None,
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            settings,
        }
    }

    /// Short-circuits identical work through `cache`
    pub fn with_cache(mut self, cache: RequestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Reports queue activity to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queues a work item
    ///
    /// Fails with `QueueFull` at capacity and `Cancelled` after shutdown.
    /// A cached output for an identical payload resolves the handle
    /// immediately without routing.
    pub fn submit(&self, item: WorkItem) -> Result<WorkHandle> {
        let (responder, receiver) = oneshot::channel();
        let handle = WorkHandle {
            id: item.id().to_string(),
            receiver,
        };

        let cache_key = self.cache.as_ref().map(|_| RequestCache::key_for(&item));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            let cached = cache.get(key);
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_lookup(cached.is_some());
            }
            if let Some(output) = cached {
                debug!("Serving work item {} from cache", item.id());
                let _ = responder.send(Ok(output));
                return Ok(handle);
            }
        }

        let priority = item.priority();
        let pending = Pending {
            item,
            responder,
            submitted_at: Instant::now(),
            cache_key,
        };

        let depth = {
            let mut queue = self.queue.lock();
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled("Queue manager is shut down".to_string()));
            }
            if let Err(e) = queue.push(priority, pending) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejected();
                }
                warn!("Rejected work item {}: {}", handle.id, e);
                return Err(e);
            }
            queue.len()
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_submitted(priority);
            metrics.set_queue_depth(depth);
        }
        self.ready.notify_one();

        trace!("Queued work item {} at {} priority", handle.id, priority);
        Ok(handle)
    }

    /// Queues a work item and waits for its result
    pub async fn execute(&self, item: WorkItem) -> Result<WorkOutput> {
        self.submit(item)?.result().await
    }

    /// Cancels a work item that has not been dispatched yet
    pub fn cancel(&self, id: &str) -> Result<()> {
        let removed = self.queue.lock().remove_first(|pending| pending.item.id() == id);

        match removed {
            Some(pending) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_cancelled();
                }
                info!("Cancelled work item {}", id);
                pending.respond(Err(Error::Cancelled(format!("Work item {} was cancelled", id))));
                Ok(())
            }
            None => Err(Error::NotFound(format!("Queued work item {}", id))),
        }
    }

    /// Number of queued work items
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of work items currently being routed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Request cache counters, if caching is enabled
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(RequestCache::stats)
    }

    /// Returns true while the dispatch loop runs
    pub fn is_running(&self) -> bool {
        self.dispatcher.lock().is_some() && !self.shutdown.is_cancelled()
    }

    /// Starts the dispatch loop. Repeated calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        info!(
            "Starting queue manager (max {} concurrent dispatches)",
            self.dispatch_limit
        );
        *dispatcher = Some(tokio::spawn(Arc::clone(self).dispatch_loop()));
    }

    /// Stops dispatching, cancels queued items and waits for in-flight ones
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        info!("Shutting down queue manager");
        self.shutdown.cancel();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Dispatch loop ended abnormally: {}", e);
            }
        }

        let abandoned = self.queue.lock().drain();
        if !abandoned.is_empty() {
            info!("Cancelling {} queued work items", abandoned.len());
        }
        for pending in abandoned {
            if let Some(metrics) = &self.metrics {
                metrics.record_cancelled();
            }
            let id = pending.item.id().to_string();
            pending.respond(Err(Error::Cancelled(format!(
                "Work item {} was cancelled by shutdown",
                id
            ))));
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(0);
        }

        let drain = self.slots.acquire_many(self.dispatch_limit);
        match tokio::time::timeout(self.settings.default_timeout(), drain).await {
            Ok(_) => {
                info!("Queue manager shut down");
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!(
                "{} dispatches still in flight after shutdown",
                self.in_flight()
            ))),
        }
    }

    /// Dispatch loop; holds the manager until shutdown
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pending = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                pending = self.next_pending() => pending,
            };
            let slot = InFlight::new(permit, Arc::clone(&self.in_flight));

            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                manager.dispatch(pending, slot).await;
            });
        }

        debug!("Dispatch loop stopped");
    }

    async fn next_pending(&self) -> Pending {
        loop {
            let next = self.queue.lock().pop();
            if let Some((_, pending)) = next {
                if let Some(metrics) = &self.metrics {
                    metrics.set_queue_depth(self.queue_len());
                }
                return pending;
            }
            self.ready.notified().await;
        }
    }

    async fn dispatch(&self, pending: Pending, slot: InFlight) {
        if pending.responder.is_closed() {
            drop(slot);
            debug!("Skipping abandoned work item {}", pending.item.id());
            if let Some(metrics) = &self.metrics {
                metrics.record_cancelled();
            }
            return;
        }

        let timeout = pending
            .item
            .timeout()
            .unwrap_or_else(|| self.settings.default_timeout());
        let operation = format!("route work item {}", pending.item.id());
        let result = execute_with_timeout(
            self.router.route_request(pending.item.clone()),
            timeout,
            &operation,
        )
        .await;
        drop(slot);

        match result {
            Ok(output) => self.complete(pending, output),
            Err(e) => self.retry_or_fail(pending, e).await,
        }
    }

    fn complete(&self, pending: Pending, output: WorkOutput) {
        if let (Some(cache), Some(key)) = (&self.cache, &pending.cache_key) {
            cache.insert(key.clone(), output.clone());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_completed(pending.submitted_at.elapsed());
        }

        trace!("Work item {} completed", pending.item.id());
        pending.respond(Ok(output));
    }

    async fn retry_or_fail(&self, mut pending: Pending, error: Error) {
        if error.is_timeout() {
            if let Some(metrics) = &self.metrics {
                metrics.record_timeout();
            }
        }

        if !error.is_retryable() || self.shutdown.is_cancelled() || !pending.item.record_retry() {
            if let Some(metrics) = &self.metrics {
                metrics.record_failed(&error);
            }
            error!("Work item {} failed: {}", pending.item.id(), error);
            pending.respond(Err(error));
            return;
        }

        warn!(
            "Work item {} failed ({}), retry {}/{}",
            pending.item.id(),
            error,
            pending.item.retries(),
            pending.item.retry_budget()
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_retry();
        }

        tokio::time::sleep(self.settings.retry_backoff()).await;

        let priority = pending.item.priority();
        let rejected = {
            let mut queue = self.queue.lock();
            if self.shutdown.is_cancelled() {
                Some((
                    pending,
                    Error::Cancelled("Queue manager shut down before retry".to_string()),
                ))
            } else {
                let capacity = queue.capacity();
                queue
                    .try_push(priority, pending)
                    .err()
                    .map(|pending| (pending, Error::QueueFull(capacity)))
            }
        };

        match rejected {
            None => self.ready.notify_one(),
            Some((pending, e)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failed(&e);
                }
                warn!("Could not requeue work item {}: {}", pending.item.id(), e);
                pending.respond(Err(e));
            }
        }
    }
}

impl BacklogSource for QueueManager {
    fn backlog(&self) -> usize {
        self.queue_len()
    }
}
