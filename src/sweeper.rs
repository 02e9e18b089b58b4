use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::{Engine, EngineError};
use crate::model::Ms;
use crate::observability;

/// Advance every booking whose window boundary has passed at `now`.
/// Returns how many transitions were applied.
pub async fn sweep_once(engine: &Engine, now: Ms) -> usize {
    let mut advanced = 0;
    for (booking_id, target) in engine.due_transitions(now).await {
        match engine.advance_state(booking_id, target).await {
            Ok(_) => {
                advanced += 1;
                metrics::counter!(observability::SWEPT_TRANSITIONS_TOTAL).increment(1);
            }
            // Cancelled or advanced by someone else since the scan.
            Err(EngineError::InvalidTransition { .. }) => {}
            Err(e) => debug!("sweeper skip {booking_id}: {e}"),
        }
    }
    advanced
}

/// Background task that moves bookings through pending → active → completed
/// as their windows start and end.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let advanced = sweep_once(&engine, crate::engine::now_ms()).await;
        if advanced > 0 {
            info!(advanced, "sweeper advanced bookings");
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
