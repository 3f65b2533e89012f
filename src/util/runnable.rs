use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::with_jitter;

/// Runs `runnable` every `interval`, measured from the start of each run, until
/// `shutdown` fires. A run that overshoots the interval is followed directly by
/// the next one.
pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable>(
    runnable: Arc<T>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let started = Instant::now();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = runnable.run_once() => {}
        }

        let deadline = started + with_jitter(interval);
        if Instant::now() < deadline {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}
