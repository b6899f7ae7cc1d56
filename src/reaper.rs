use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::registry::Registry;

/// Background task that periodically releases expired holds.
pub async fn run_reaper(registry: Arc<Registry>, sweep_interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval_secs));
    loop {
        interval.tick().await;
        let expired = registry.collect_expired_holds(Utc::now());
        for (resource_id, start) in expired {
            match registry.expire_hold(resource_id, start).await {
                Ok(true) => {
                    metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(1);
                    info!("reaped expired hold on {resource_id} at {start}");
                }
                Ok(false) => {
                    // Already released, re-reserved, or booked in the meantime
                    tracing::debug!("reaper skip {resource_id} at {start}");
                }
                Err(e) => {
                    tracing::warn!("reaper failed on {resource_id} at {start}: {e}");
                }
            }
        }
    }
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(registry: Arc<Registry>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = registry.appends_since_compact().await;
        if appends >= threshold {
            match registry.compact_wal().await {
                Ok(events) => {
                    info!("compacted WAL to {events} live events after {appends} appends");
                }
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
