use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Rewrites a tenant's WAL from live state once enough events pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}
