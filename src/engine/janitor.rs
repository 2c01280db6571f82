//! Staleness janitor: hands silent jobs back to the pool.
//!
//! A worker that crashes simply stops heartbeating. Once its job's
//! `heartbeat_at` is older than the threshold, the janitor clears
//! `worker_id` with a conditional update guarded by that same stale owner,
//! so a heartbeat landing in between wins.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::JobId;
use crate::store::JobStore;
use crate::telemetry::metrics;
use chrono::TimeDelta;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Heartbeat interval and staleness threshold, kept consistent.
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    heartbeat_interval: Duration,
    stale_after: Duration,
}

impl StalenessPolicy {
    /// Minimum ratio of threshold to heartbeat interval.
    pub const SAFETY_FACTOR: u32 = 3;

    pub fn new(heartbeat_interval: Duration, stale_after: Duration) -> Result<Self> {
        if heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".into()));
        }
        if stale_after < heartbeat_interval * Self::SAFETY_FACTOR {
            return Err(Error::Config(format!(
                "staleness threshold {}s must be at least {}x the heartbeat interval {}s",
                stale_after.as_secs_f64(),
                Self::SAFETY_FACTOR,
                heartbeat_interval.as_secs_f64(),
            )));
        }
        TimeDelta::from_std(stale_after)
            .map_err(|e| Error::Config(format!("staleness threshold out of range: {e}")))?;
        Ok(Self {
            heartbeat_interval,
            stale_after,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn stale_after_delta(&self) -> TimeDelta {
        // Range checked in `new`.
        TimeDelta::from_std(self.stale_after).unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub policy: StalenessPolicy,
    /// Pause between sweeps in [`Janitor::run`].
    pub sweep_interval: Duration,
    /// Rows examined per store round trip.
    pub batch_size: usize,
}

impl JanitorConfig {
    pub fn new(policy: StalenessPolicy, sweep_interval: Duration) -> Self {
        Self {
            policy,
            sweep_interval,
            batch_size: 100,
        }
    }
}

pub struct Janitor {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: JanitorConfig,
    shutdown: Arc<Notify>,
}

impl Janitor {
    pub fn new(store: Arc<dyn JobStore>, config: JanitorConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Signal [`run`](Self::run) to return.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Release every job silent for longer than the threshold. Returns the
    /// jobs that became claimable.
    pub async fn sweep_once(&self) -> Result<Vec<JobId>> {
        let cutoff = self.clock.now() - self.config.policy.stale_after_delta();
        let mut released = Vec::new();

        loop {
            let stale = self
                .store
                .list_stale(cutoff, self.config.batch_size)
                .await?;
            let batch_len = stale.len();
            let mut released_in_batch = 0;

            for job in stale {
                let Some(owner) = job.worker_id.as_ref() else {
                    continue;
                };
                if self.store.release(job.job_id, owner, cutoff).await? {
                    warn!(
                        job_id = %job.job_id,
                        job_uri = %job.job_uri,
                        worker = %owner,
                        heartbeat_at = ?job.heartbeat_at,
                        "released stale job"
                    );
                    metrics::stale_released().add(1, &[]);
                    released.push(job.job_id);
                    released_in_batch += 1;
                }
            }

            if batch_len < self.config.batch_size || released_in_batch == 0 {
                break;
            }
        }

        if !released.is_empty() {
            info!(count = released.len(), "janitor sweep released jobs");
        }
        Ok(released)
    }

    /// Sweep on a fixed cadence until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        info!(
            stale_after_secs = self.config.policy.stale_after().as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "janitor started"
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                error!("janitor sweep failed: {e}");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("janitor shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
        }
    }
}
