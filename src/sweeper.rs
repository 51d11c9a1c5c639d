use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::now_ms;
use crate::engine::Engine;

/// One sweeper pass: complete every confirmed reservation that has ended,
/// then compact the WAL if enough appends have piled up.
/// Returns how many reservations were completed.
pub async fn sweep_once(engine: &Engine, now: i64, compact_threshold: u64) -> usize {
    let mut completed = 0;
    for id in engine.collect_elapsed_reservations(now) {
        match engine.complete_reservation(id).await {
            Ok(_) => {
                completed += 1;
                debug!(%id, "reservation completed by sweeper");
            }
            Err(e) if e.is_retryable() => {
                warn!("sweeper stopped at {id}, will retry next sweep: {e}");
                break;
            }
            // Cancelled or deleted since collection.
            Err(e) => debug!("sweeper skip {id}: {e}"),
        }
    }
    if completed > 0 {
        metrics::counter!(crate::observability::RESERVATIONS_SWEPT_TOTAL)
            .increment(completed as u64);
        info!(completed, "swept elapsed reservations");
    }

    if compact_threshold > 0 && engine.wal_appends_since_compact().await >= compact_threshold {
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
    completed
}

/// Background task that periodically runs [`sweep_once`].
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration, compact_threshold: u64) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&engine, now_ms(), compact_threshold).await;
    }
}
