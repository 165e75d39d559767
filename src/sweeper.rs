use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::{Actor, Ms};
use crate::observability;

/// What one sweep pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub transitioned: usize,
    /// Candidates that changed underneath the sweep; retried next tick if still due.
    pub skipped: usize,
}

/// Background task that applies time-based transitions on every tick.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.policy().sweep_interval);
    loop {
        interval.tick().await;
        let report = sweep_once(&engine, crate::engine::now_ms()).await;
        if report.transitioned > 0 {
            info!(
                "sweep moved {} reservations ({} skipped)",
                report.transitioned, report.skipped
            );
        }
    }
}

/// One pass over every reservation due at `now`. Running it twice in a row
/// changes nothing the second time.
pub async fn sweep_once(engine: &Engine, now: Ms) -> SweepReport {
    let started = Instant::now();
    let system = Actor::system();
    let mut report = SweepReport::default();

    for candidate in engine.collect_sweep_candidates(now) {
        let id = candidate.reservation_id;
        let operation = candidate.operation.name();
        match engine
            .apply_operation(id, candidate.operation, &system, Some(candidate.version), now)
            .await
        {
            Ok(outcome) => {
                report.transitioned += 1;
                metrics::counter!(observability::SWEEP_TRANSITIONS_TOTAL, "operation" => operation).increment(1);
                info!(
                    "sweeper: {operation} {id} ({} -> {})",
                    outcome.previous_status.map_or("none", |s| s.as_str()),
                    outcome.reservation.status
                );
            }
            Err(e @ (EngineError::Conflict { .. } | EngineError::InvalidStateTransition { .. } | EngineError::NotFound(_))) => {
                // A human action got there first.
                report.skipped += 1;
                debug!("sweeper skip {id}: {e}");
            }
            Err(e) => {
                report.skipped += 1;
                warn!("sweeper failed on {id}: {e}");
            }
        }
    }

    metrics::histogram!(observability::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    report
}

/// Background task that compacts the WAL once enough appends accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
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
