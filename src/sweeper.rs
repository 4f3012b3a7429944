use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::store::LocalStore;

/// Background task that lapses expired holds and completes finished bookings.
/// Booking times are court-local wall-clock times; the host's local time zone is used.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.sweep(Utc::now(), Local::now().naive_local()).await {
            Ok(report) if report.expired + report.completed > 0 => {
                info!("sweep: {} holds expired, {} bookings completed", report.expired, report.completed);
            }
            Ok(_) => debug!("sweep: nothing to do"),
            Err(e) => warn!("sweep failed: {e}"),
        }
    }
}

/// Background task that compacts the local ledger once enough appends pile up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted ledger after {appends} appends"),
            Err(e) => tracing::error!("ledger compaction failed: {e}"),
        }
    }
}
