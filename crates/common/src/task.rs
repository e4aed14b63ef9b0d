//! Cancellable periodic background tasks
//!
//! Timer-driven loops (health checks, strategy evaluation, scaling, resource
//! sampling) are owned through a [`BackgroundTask`] handle. Stopping the
//! handle cancels the loop and joins it; a tick already in progress runs to
//! completion first.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a periodic background loop
#[derive(Debug)]
pub struct BackgroundTask {
    /// Loop name, used in logs
    name: String,

    /// Cancellation signal observed between ticks
    token: CancellationToken,

    /// Join handle of the spawned loop
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `tick` every `period`. The first tick fires one full period
    /// after spawning.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let loop_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }

            debug!("Background task {} exited", loop_name);
        });

        debug!("Background task {} started with period {:?}", name, period);

        Self { name, token, handle }
    }

    /// Gets the loop name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the loop and waits for it to exit
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Background task {} terminated abnormally: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let task = BackgroundTask::spawn("counter", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        task.stop().await;
        let observed = ticks.load(Ordering::SeqCst);
        assert_eq!(observed, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), observed);
    }
}
