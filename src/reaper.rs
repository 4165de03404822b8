use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::engine::{Engine, now_ms};

/// An interval whose first tick is one full period away.
fn after_one_period(every: Duration) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + every, every)
}

/// Periodically delete expired access grants, starting one period after launch.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = after_one_period(every);
    loop {
        interval.tick().await;
        let report = engine.sweep(now_ms()).await;
        if report.failed_batches > 0 {
            warn!(
                failed_batches = report.failed_batches,
                "grant sweep incomplete; remaining grants retried next run"
            );
        }
    }
}

/// Periodically resolve waiting periods and complete ended bookings.
///
/// Safe to run more often than daily: a tick with nothing due changes nothing.
/// The first tick comes one period after launch.
pub async fn run_lifecycle(engine: Arc<Engine>, every: Duration) {
    let mut interval = after_one_period(every);
    loop {
        interval.tick().await;
        let today = chrono::Utc::now().date_naive();
        let report = engine.process_lifecycle_tick(today).await;
        if report.failed > 0 {
            error!(failed = report.failed, %today, "lifecycle tick had failures");
        }
    }
}

/// Compact the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            debug!(appends, threshold, "compaction not due");
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
