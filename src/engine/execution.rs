//! Run one claimed job to a terminal state.
//!
//! The executor runs in its own task while this side heartbeats on a fixed
//! interval. Whatever the executor does (succeeds, returns an error, panics)
//! ends in `finish()`; the only exit without `finish()` is lost ownership.

use crate::error::{Error, Result};
use crate::job::ClaimedJob;
use crate::model::{FinishStats, Job};
use crate::registry::JobRegistry;
use crate::telemetry::job::record_transition;
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{Span, error, warn};

/// Execute `claimed` and record the outcome.
///
/// Returns the finished row, or `Error::LostOwnership` if another worker took
/// over meanwhile; in that case nothing more was written.
pub async fn run_to_finish(
    registry: &JobRegistry,
    mut claimed: ClaimedJob,
    heartbeat_interval: Duration,
    span: &Span,
) -> Result<Job> {
    let job_type = match registry.get(&claimed.job().kind) {
        Ok(t) => t.clone(),
        Err(e) => {
            error!(kind = %claimed.job().kind, "no executor for claimed job");
            record_transition(span, "claimed", "finished");
            return claimed.finish(FinishStats::failed(e.to_string())).await;
        }
    };

    let ctx = claimed.context();
    let mut handle = tokio::spawn(async move { job_type.execute(&ctx).await });

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            _ = ticker.tick() => {
                match claimed.heartbeat().await {
                    Ok(()) => {}
                    Err(e @ Error::LostOwnership { .. }) => {
                        handle.abort();
                        record_transition(span, "claimed", "unclaimed");
                        return Err(e);
                    }
                    // Transient; the next tick tries again well before the janitor's threshold.
                    Err(e) => warn!("heartbeat failed: {e}"),
                }
            }
        }
    };

    let stats = match stats_for(joined) {
        Ok(stats) => stats,
        Err(e) => {
            record_transition(span, "claimed", "unclaimed");
            return Err(e);
        }
    };
    span.record("job.status", stats.status.to_string());
    record_transition(span, "claimed", "finished");
    claimed.finish(stats).await
}

fn stats_for(joined: std::result::Result<Result<Option<Value>>, JoinError>) -> Result<FinishStats> {
    match joined {
        Ok(Ok(data)) => Ok(FinishStats::ok(data)),
        Ok(Err(e @ Error::LostOwnership { .. })) => Err(e),
        Ok(Err(e)) => {
            error!("job execution failed: {e}");
            Ok(FinishStats::failed(e.to_string()))
        }
        Err(join) if join.is_panic() => {
            error!("job executor panicked");
            Ok(FinishStats::failed(format!("executor panicked: {join}")))
        }
        Err(join) => Ok(FinishStats::failed(format!("executor cancelled: {join}"))),
    }
}
