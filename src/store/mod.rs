//! Store adapter: the two primitives the queue is built on.
//!
//! Any backend works as long as it offers (a) insert with a unique constraint
//! on `job_uri` and (b) atomic conditional update of a single row. Every
//! mutating method below is exactly one such operation; none of them may be
//! emulated with a read followed by a write.

pub mod memory;

pub use memory::MemoryJobStore;

use crate::error::Result;
use crate::model::{FinishStats, Job, JobFilter, JobId, JobState, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. A `job_uri` collision yields `Error::AlreadyExists`.
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Unclaimed, unfinished jobs matching `filter`, oldest first.
    async fn find_unclaimed(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>>;

    /// Set `worker_id` from null to `worker` (and `started_at` if unset).
    /// Returns the updated row, or `None` if the job is gone, owned or finished.
    async fn claim(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>)
    -> Result<Option<Job>>;

    /// Advance `heartbeat_at` if `worker` still owns the unfinished job.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Mark finished if `worker` still owns the unfinished job. `time_took`
    /// is measured from `started_at`.
    async fn finish(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        stats: &FinishStats,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Claimed, unfinished jobs whose last heartbeat is older than `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Clear ownership of a stale job, guarded by the stale owner still
    /// holding it and no heartbeat since `cutoff`. Returns whether it happened.
    async fn release(&self, job_id: JobId, worker: &WorkerId, cutoff: DateTime<Utc>)
    -> Result<bool>;

    /// Jobs matching `filter` and optionally `state`, newest first.
    async fn list(
        &self,
        filter: &JobFilter,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>>;
}

/// Elapsed milliseconds between claim and finish.
pub(crate) fn elapsed_ms(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}
