//! In-memory job store.
//!
//! One mutex guards all rows, so every trait method is a single atomic step,
//! the same guarantee a database gives per statement. Only useful within one
//! process: tests and dry runs.

use super::{JobStore, elapsed_ms};
use crate::error::{Error, Result};
use crate::model::{FinishStats, Job, JobFilter, JobId, JobState, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Rows {
    jobs: HashMap<JobId, Job>,
    /// Unique index on `job_uri`.
    by_uri: HashMap<String, JobId>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    rows: Mutex<Rows>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.by_uri.contains_key(&job.job_uri) {
            return Err(Error::AlreadyExists(job.job_uri.clone()));
        }
        rows.by_uri.insert(job.job_uri.clone(), job.job_id);
        rows.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.rows.lock().await.jobs.get(&job_id).cloned())
    }

    async fn find_unclaimed(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        let rows = self.rows.lock().await;
        let mut found: Vec<Job> = rows
            .jobs
            .values()
            .filter(|j| j.state() == JobState::Unclaimed && filter.matches(j))
            .cloned()
            .collect();
        found.sort_by_key(|j| j.created_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn claim(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut rows = self.rows.lock().await;
        let Some(job) = rows.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.worker_id.is_some() || job.finished {
            return Ok(None);
        }
        job.worker_id = Some(worker.clone());
        job.started_at.get_or_insert(now);
        job.heartbeat_at = Some(job.heartbeat_at.map_or(now, |hb| hb.max(now)));
        job.pickups += 1;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut rows = self.rows.lock().await;
        match rows.jobs.get_mut(&job_id) {
            Some(job) if job.is_owned_by(worker) && !job.finished => {
                job.heartbeat_at = Some(job.heartbeat_at.map_or(now, |hb| hb.max(now)));
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        stats: &FinishStats,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut rows = self.rows.lock().await;
        match rows.jobs.get_mut(&job_id) {
            Some(job) if job.is_owned_by(worker) && !job.finished => {
                job.finished = true;
                job.finished_at = Some(now);
                job.time_took_ms = Some(elapsed_ms(job.started_at, now));
                job.stats = Some(stats.clone());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let rows = self.rows.lock().await;
        let mut stale: Vec<Job> = rows
            .jobs
            .values()
            .filter(|j| j.state() == JobState::Claimed && j.heartbeat_at.is_none_or(|hb| hb < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.heartbeat_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn release(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        match rows.jobs.get_mut(&job_id) {
            Some(job)
                if job.is_owned_by(worker)
                    && !job.finished
                    && job.heartbeat_at.is_none_or(|hb| hb < cutoff) =>
            {
                job.worker_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        filter: &JobFilter,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let rows = self.rows.lock().await;
        let mut found: Vec<Job> = rows
            .jobs
            .values()
            .filter(|j| filter.matches(j) && state.is_none_or(|s| j.state() == s))
            .cloned()
            .collect();
        found.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        found.truncate(limit);
        Ok(found)
    }
}
