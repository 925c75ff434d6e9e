use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// One sweep: expire every active membership past its expiry date.
/// Returns how many rows were flipped.
pub async fn expire_memberships(engine: &Engine) -> usize {
    let today = Local::now().date_naive();
    let mut expired = 0;
    for id in engine.collect_expired_memberships(today) {
        match engine.expire_membership(id, today).await {
            Ok(true) => {
                info!("expired membership {id}");
                expired += 1;
            }
            // Recharged or expired by someone else since the scan.
            Ok(false) => debug!("reaper skip {id}: no longer past due"),
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }
    expired
}

/// Background task that periodically expires past-due memberships.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        expire_memberships(&engine).await;
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
