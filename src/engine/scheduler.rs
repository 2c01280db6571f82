//! One scheduling cycle: optionally enqueue, then find, claim and run a job.
//!
//! Invoked repeatedly by an outside supervisor (cron, systemd timer). There
//! is no coordinator: concurrent cycles on other hosts only meet at the
//! store's conditional updates.

use super::execution::run_to_finish;
use crate::error::{Error, Result};
use crate::job::{ClaimedJob, Jobs};
use crate::model::{Job, JobFilter, JobId, JobRequest, JobStatus, WorkerId};
use crate::telemetry::job::{record_transition, start_job_span};
use std::time::Duration;
use tracing::{Instrument, debug, error, info, warn};

/// Configuration for the scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often a running job heartbeats.
    pub heartbeat_interval: Duration,
    /// Candidates to try per cycle before giving up on lost races.
    pub max_candidates: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_candidates: 5,
        }
    }
}

/// What happened to the optional job request.
#[derive(Debug)]
pub enum Submitted {
    Created(Box<Job>),
    /// Same task already stored. Not an error.
    AlreadyExists(String),
    /// Request was invalid or of an unknown kind.
    Rejected(String),
}

/// What the claiming half of a cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing unclaimed matched the filter.
    Idle,
    /// Every candidate was taken by another worker first.
    LostRaces(usize),
    /// A job ran to completion (successfully or not).
    Executed {
        job_id: JobId,
        job_uri: String,
        status: JobStatus,
        time_took_ms: u64,
    },
    /// Ownership was lost mid-run; the job was left to its new owner.
    Abandoned { job_id: JobId },
}

/// Result of looking for a job to claim.
pub enum Pick {
    Claimed(Box<ClaimedJob>),
    Empty,
    LostRaces(usize),
}

#[derive(Debug)]
pub struct CycleReport {
    pub submitted: Option<Submitted>,
    pub outcome: CycleOutcome,
}

pub struct Scheduler {
    jobs: Jobs,
    worker_id: WorkerId,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(jobs: Jobs, worker_id: WorkerId, config: SchedulerConfig) -> Self {
        Self {
            jobs,
            worker_id,
            config,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Enqueue a request. Duplicates and invalid requests come back as
    /// values; only store failures are errors.
    pub async fn submit(&self, request: &JobRequest) -> Result<Submitted> {
        match self.jobs.create(request).await {
            Ok(job) => Ok(Submitted::Created(Box::new(job))),
            Err(Error::AlreadyExists(uri)) => {
                info!(job_uri = %uri, "job already exists, nothing to create");
                Ok(Submitted::AlreadyExists(uri))
            }
            Err(e @ (Error::Validation { .. } | Error::UnsupportedKind(_))) => {
                error!("job request rejected: {e}");
                Ok(Submitted::Rejected(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the oldest unclaimed job matching `filter`, moving on to the
    /// next candidate when another worker wins a race.
    pub async fn pick(&self, filter: &JobFilter) -> Result<Pick> {
        let candidates = self
            .jobs
            .store()
            .find_unclaimed(filter, self.config.max_candidates)
            .await?;

        let mut lost = 0;
        for candidate in candidates {
            match self.jobs.claim(candidate.job_id, &self.worker_id).await {
                Ok(claimed) => return Ok(Pick::Claimed(Box::new(claimed))),
                Err(Error::PickupFailed { job_id, owner }) => {
                    debug!(%job_id, ?owner, "lost race, trying next candidate");
                    lost += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(if lost == 0 {
            Pick::Empty
        } else {
            Pick::LostRaces(lost)
        })
    }

    /// Run one full cycle.
    pub async fn run_cycle(
        &self,
        request: Option<&JobRequest>,
        filter: &JobFilter,
    ) -> Result<CycleReport> {
        let submitted = match request {
            Some(request) => Some(self.submit(request).await?),
            None => None,
        };

        let claimed = match self.pick(filter).await? {
            Pick::Claimed(claimed) => *claimed,
            Pick::Empty => {
                info!("no job to pick up");
                return Ok(CycleReport {
                    submitted,
                    outcome: CycleOutcome::Idle,
                });
            }
            Pick::LostRaces(lost) => {
                info!(lost, "all candidates taken by other workers");
                return Ok(CycleReport {
                    submitted,
                    outcome: CycleOutcome::LostRaces(lost),
                });
            }
        };

        let job_id = claimed.job().job_id;
        let span = start_job_span(&claimed.job().kind, job_id, &self.worker_id);
        record_transition(&span, "unclaimed", "claimed");

        let outcome = run_to_finish(
            self.jobs.registry(),
            claimed,
            self.config.heartbeat_interval,
            &span,
        )
        .instrument(span.clone())
        .await;

        let outcome = match outcome {
            Ok(job) => CycleOutcome::Executed {
                job_id,
                status: job
                    .stats
                    .as_ref()
                    .map(|s| s.status)
                    .unwrap_or(JobStatus::Ok),
                time_took_ms: job.time_took_ms.unwrap_or(0),
                job_uri: job.job_uri,
            },
            Err(Error::LostOwnership { .. }) => {
                warn!(%job_id, worker = %self.worker_id, "abandoned job after losing ownership");
                CycleOutcome::Abandoned { job_id }
            }
            Err(e) => return Err(e),
        };

        Ok(CycleReport { submitted, outcome })
    }
}
