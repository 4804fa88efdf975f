//! Periodic pruning of in-memory usage counters.
//!
//! - Daily allowances not dated today (hourly).
//! - Rate-limit windows that have closed (every minute).
//! - Import progress entries past their expiry (every minute).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_core::quota::{DailyUsageTracker, RateLimiter};
use kiln_pipeline::assets::progress::ProgressTracker;
use tokio_util::sync::CancellationToken;

const DAILY_SWEEP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour
const WINDOW_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the sweep loop until `cancel` is triggered.
pub async fn run(
    daily: Arc<DailyUsageTracker>,
    rate_limiter: Arc<RateLimiter>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
) {
    tracing::info!(
        daily_interval_secs = DAILY_SWEEP_INTERVAL.as_secs(),
        window_interval_secs = WINDOW_SWEEP_INTERVAL.as_secs(),
        "Usage sweep started"
    );

    let mut daily_tick = tokio::time::interval(DAILY_SWEEP_INTERVAL);
    let mut window_tick = tokio::time::interval(WINDOW_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Usage sweep stopping");
                break;
            }
            _ = daily_tick.tick() => {
                let pruned = daily.prune(Utc::now().date_naive());
                if pruned > 0 {
                    tracing::info!(pruned, "Usage sweep: dropped stale daily counters");
                }
            }
            _ = window_tick.tick() => {
                let windows = rate_limiter.prune(Utc::now().timestamp_millis());
                let imports = progress.prune();
                tracing::debug!(windows, imports, "Usage sweep: pruned expired entries");
            }
        }
    }
}
