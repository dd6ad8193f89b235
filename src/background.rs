//! Background tasks: stale staging cleanup and rate-limit window pruning.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{RATE_PRUNE_INTERVAL_SECS, STAGING_CLEAN_INTERVAL_SECS};
use crate::ratelimit::RateLimiter;
use crate::staging::StagingManager;

/// Spawns the periodic maintenance tasks.
pub fn spawn_background_tasks(
    staging: Arc<StagingManager>,
    limiter: Arc<RateLimiter>,
    staging_ttl: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = staging.cleanup_stale(staging_ttl).await {
                warn!(error = %err, "staging cleanup failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            limiter.prune().await;
        }
    });
}
