use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio_util::sync::CancellationToken;

pub(crate) mod retry;
pub(crate) mod runnable;

/// Sleeps for `duration` unless `token` fires first.
///
/// Returns `true` when the full duration elapsed and `false` on cancellation.
pub(crate) async fn sleep_or_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Wall-clock milliseconds since the Unix epoch; lease timestamps are compared
/// across hosts so this cannot be a monotonic clock.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Spreads `interval` by up to +/-10% so hosts started together drift apart.
pub(crate) fn with_jitter(interval: Duration) -> Duration {
    let spread = interval.as_millis() as u64 / 10;
    if spread == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    (interval + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(spread))
}
