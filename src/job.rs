//! Job lifecycle: create, claim, heartbeat, finish.
//!
//! One concrete implementation for every kind. Kind-specific behavior comes
//! from the registry; every state change is a single conditional update at
//! the store, so no two workers can ever own the same job at once.
//!
//! ```text
//! Unclaimed --claim--> Claimed --finish--> Finished
//!     ^                 |   ^
//!     +---janitor-------+   +--heartbeat (same owner)
//! ```

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{FinishStats, Job, JobId, JobRequest, WorkerId};
use crate::registry::JobRegistry;
use crate::store::JobStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point to the job lifecycle over a shared store.
#[derive(Clone)]
pub struct Jobs {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl Jobs {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock (tests, simulations).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Validate and persist a new job.
    ///
    /// Returns `Error::AlreadyExists(job_uri)` when the same task is already
    /// stored; callers should read that as "nothing to do".
    pub async fn create(&self, request: &JobRequest) -> Result<Job> {
        let validated = self.registry.construct(request)?;
        let job = Job::new(
            &validated.kind,
            validated.def,
            validated.job_uri,
            self.clock.now(),
        );

        match self.store.insert(&job).await {
            Ok(()) => {
                metrics::jobs_created().add(
                    1,
                    &[
                        KeyValue::new("kind", job.kind.clone()),
                        KeyValue::new("result", "created"),
                    ],
                );
                info!(job_id = %job.job_id, job_uri = %job.job_uri, "job created");
                Ok(job)
            }
            Err(Error::AlreadyExists(uri)) => {
                metrics::jobs_created().add(
                    1,
                    &[
                        KeyValue::new("kind", job.kind.clone()),
                        KeyValue::new("result", "duplicate"),
                    ],
                );
                debug!(job_uri = %uri, "job already exists");
                Err(Error::AlreadyExists(uri))
            }
            Err(e) => Err(e),
        }
    }

    /// Get a job by ID.
    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(job_id.0.to_string()))
    }

    /// Take ownership of an unclaimed job.
    ///
    /// Exactly one of any number of concurrent callers succeeds; the others
    /// get `PickupFailed`, naming the current owner when there is one.
    pub async fn claim(&self, job_id: JobId, worker: &WorkerId) -> Result<ClaimedJob> {
        let now = self.clock.now();
        match self.store.claim(job_id, worker, now).await? {
            Some(job) => {
                metrics::job_claims().add(1, &[KeyValue::new("result", "ok")]);
                info!(%job_id, job_uri = %job.job_uri, %worker, pickups = job.pickups, "job claimed");
                Ok(ClaimedJob {
                    lease: Lease {
                        jobs: self.clone(),
                        job_id,
                        worker_id: worker.clone(),
                    },
                    job,
                })
            }
            None => {
                metrics::job_claims().add(1, &[KeyValue::new("result", "lost")]);
                // Diagnostic read only; the decision was made by the update above.
                let owner = self
                    .store
                    .get(job_id)
                    .await?
                    .and_then(|j| j.worker_id)
                    .map(|w| w.to_string());
                debug!(%job_id, ?owner, "pickup failed");
                Err(Error::PickupFailed {
                    job_id: job_id.0.to_string(),
                    owner,
                })
            }
        }
    }

    /// Refresh `heartbeat_at`, fenced by `worker`.
    pub async fn heartbeat(&self, job_id: JobId, worker: &WorkerId) -> Result<Job> {
        let now = self.clock.now();
        match self.store.heartbeat(job_id, worker, now).await? {
            Some(job) => {
                metrics::heartbeats().add(1, &[KeyValue::new("result", "ok")]);
                debug!(%job_id, %worker, "heartbeat");
                Ok(job)
            }
            None => {
                metrics::heartbeats().add(1, &[KeyValue::new("result", "lost")]);
                warn!(%job_id, %worker, "heartbeat rejected, ownership lost");
                Err(lost(job_id, worker))
            }
        }
    }

    /// Mark the job finished with `stats`, fenced by `worker`.
    pub async fn finish(&self, job_id: JobId, worker: &WorkerId, stats: FinishStats) -> Result<Job> {
        let now = self.clock.now();
        match self.store.finish(job_id, worker, &stats, now).await? {
            Some(job) => {
                let took = job.time_took_ms.unwrap_or(0);
                metrics::jobs_finished().add(
                    1,
                    &[
                        KeyValue::new("kind", job.kind.clone()),
                        KeyValue::new("status", stats.status.to_string()),
                    ],
                );
                metrics::job_duration_ms()
                    .record(took as f64, &[KeyValue::new("kind", job.kind.clone())]);
                info!(%job_id, %worker, status = %stats.status, time_took_ms = took, "job finished");
                Ok(job)
            }
            None => {
                warn!(%job_id, %worker, "finish rejected, ownership lost");
                Err(lost(job_id, worker))
            }
        }
    }
}

fn lost(job_id: JobId, worker: &WorkerId) -> Error {
    Error::LostOwnership {
        job_id: job_id.0.to_string(),
        worker_id: worker.to_string(),
    }
}

/// Right to write to one claimed job: the job ID plus the fencing token.
#[derive(Clone)]
pub struct Lease {
    jobs: Jobs,
    job_id: JobId,
    worker_id: WorkerId,
}

impl Lease {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub async fn heartbeat(&self) -> Result<Job> {
        self.jobs.heartbeat(self.job_id, &self.worker_id).await
    }

    async fn finish(&self, stats: FinishStats) -> Result<Job> {
        self.jobs.finish(self.job_id, &self.worker_id, stats).await
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("job_id", &self.job_id)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// A job this worker owns.
pub struct ClaimedJob {
    job: Job,
    lease: Lease,
}

impl ClaimedJob {
    /// Row as of the last successful write.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.lease.worker_id
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.job = self.lease.heartbeat().await?;
        Ok(())
    }

    /// Record the terminal state. Consumes the handle: a job finishes once.
    pub async fn finish(self, stats: FinishStats) -> Result<Job> {
        self.lease.finish(stats).await
    }

    /// What an executor gets to see.
    pub fn context(&self) -> JobContext {
        JobContext {
            job: self.job.clone(),
            lease: self.lease.clone(),
        }
    }
}

impl std::fmt::Debug for ClaimedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedJob")
            .field("job", &self.job)
            .field("lease", &self.lease)
            .finish()
    }
}

/// Handed to a `JobType` executor.
#[derive(Clone, Debug)]
pub struct JobContext {
    job: Job,
    lease: Lease,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn def(&self) -> &Value {
        &self.job.def
    }

    /// Signal liveness. `Err(LostOwnership)` means stop now and write nothing.
    pub async fn heartbeat(&self) -> Result<()> {
        self.lease.heartbeat().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kinds;
    use crate::model::{JobState, Service};
    use crate::store::MemoryJobStore;
    use chrono::Duration;

    fn jobs() -> (Jobs, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = kinds::registry(Arc::new(kinds::calc_bpm::FixedAnalyzer::default()))
            .expect("builtin kinds register");
        let jobs = Jobs::new(Arc::new(MemoryJobStore::new()), Arc::new(registry))
            .with_clock(clock.clone());
        (jobs, clock)
    }

    fn request() -> JobRequest {
        JobRequest::calc_bpm("u1", Service::Yandexmusic, "123")
    }

    #[tokio::test]
    async fn claim_sets_owner_started_and_heartbeat() {
        let (jobs, clock) = jobs();
        let job = jobs.create(&request()).await.unwrap();
        let w = WorkerId::from("A");

        let claimed = jobs.claim(job.job_id, &w).await.unwrap();
        let row = claimed.job();
        assert_eq!(row.state(), JobState::Claimed);
        assert_eq!(row.worker_id.as_ref(), Some(&w));
        assert_eq!(row.started_at, Some(clock.now()));
        assert_eq!(row.heartbeat_at, Some(clock.now()));
        assert_eq!(row.pickups, 1);
    }

    #[tokio::test]
    async fn claimed_job_debug_shows_row_and_fencing_token() {
        let (jobs, _) = jobs();
        let job = jobs.create(&request()).await.unwrap();
        let claimed = jobs.claim(job.job_id, &WorkerId::from("A")).await.unwrap();

        let shown = format!("{claimed:?}");
        assert!(shown.starts_with("ClaimedJob"));
        assert!(shown.contains("calc_bpm/u1/yandexmusic/123"));
        assert!(shown.contains("Lease"));
        assert!(format!("{:?}", claimed.context()).contains("JobContext"));

        // Results carrying a claim can be unwrapped either way in tests.
        let lost = jobs.claim(job.job_id, &WorkerId::from("B")).await;
        assert!(matches!(lost.unwrap_err(), Error::PickupFailed { .. }));
    }

    #[tokio::test]
    async fn second_claim_by_same_worker_fails() {
        let (jobs, _) = jobs();
        let job = jobs.create(&request()).await.unwrap();
        let w = WorkerId::from("A");
        jobs.claim(job.job_id, &w).await.unwrap();
        let err = jobs.claim(job.job_id, &w).await.unwrap_err();
        assert!(matches!(err, Error::PickupFailed { owner: Some(o), .. } if o == "A"));
    }

    #[tokio::test]
    async fn claim_of_missing_job_reports_no_owner() {
        let (jobs, _) = jobs();
        let err = jobs
            .claim(JobId::new(), &WorkerId::from("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PickupFailed { owner: None, .. }));
    }

    #[tokio::test]
    async fn heartbeat_by_stranger_is_lost_ownership() {
        let (jobs, _) = jobs();
        let job = jobs.create(&request()).await.unwrap();
        jobs.claim(job.job_id, &WorkerId::from("A")).await.unwrap();
        let err = jobs
            .heartbeat(job.job_id, &WorkerId::from("B"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LostOwnership { .. }));
    }

    #[tokio::test]
    async fn finish_records_time_took() {
        let (jobs, clock) = jobs();
        let job = jobs.create(&request()).await.unwrap();
        let claimed = jobs.claim(job.job_id, &WorkerId::from("A")).await.unwrap();
        clock.advance(Duration::seconds(42));
        let done = claimed.finish(FinishStats::ok(None)).await.unwrap();
        assert!(done.finished);
        assert_eq!(done.time_took_ms, Some(42_000));
        assert_eq!(done.finished_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn context_heartbeat_advances_row() {
        let (jobs, clock) = jobs();
        let job = jobs.create(&request()).await.unwrap();
        let claimed = jobs.claim(job.job_id, &WorkerId::from("A")).await.unwrap();
        let ctx = claimed.context();
        clock.advance(Duration::seconds(10));
        ctx.heartbeat().await.unwrap();
        let row = jobs.get(job.job_id).await.unwrap();
        assert_eq!(row.heartbeat_at, Some(clock.now()));
    }
}
