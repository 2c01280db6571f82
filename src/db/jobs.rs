//! Postgres job store. Every mutation is a single guarded statement.

use super::Db;
use crate::error::{Error, Result};
use crate::model::{FinishStats, Job, JobFilter, JobId, JobState, WorkerId};
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

const COLUMNS: &str = "job_id, kind, def, job_uri, worker_id, finished, created_at, \
     started_at, heartbeat_at, finished_at, time_took_ms, stats, pickups";

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    kind: String,
    def: Value,
    job_uri: String,
    worker_id: Option<String>,
    finished: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    time_took_ms: Option<i64>,
    stats: Option<Value>,
    pickups: i32,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        let stats: Option<FinishStats> = self.stats.map(serde_json::from_value).transpose()?;
        Ok(Job {
            job_id: JobId(self.job_id),
            kind: self.kind,
            def: self.def,
            job_uri: self.job_uri,
            worker_id: self.worker_id.map(WorkerId::from),
            finished: self.finished,
            created_at: self.created_at,
            started_at: self.started_at,
            heartbeat_at: self.heartbeat_at,
            finished_at: self.finished_at,
            time_took_ms: self.time_took_ms.map(|ms| ms.max(0) as u64),
            stats,
            pickups: self.pickups.max(0) as u32,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(JobRow::try_into_job).collect()
}

/// `def @> {}` holds for every object, so an empty filter matches all rows.
fn def_containment(filter: &JobFilter) -> Value {
    Value::Object(filter.def.clone())
}

/// `LIKE` pattern matching strings that start with `prefix` literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn state_name(state: Option<JobState>) -> Option<String> {
    state.map(|s| s.to_string())
}

impl Db {
    /// Resolve a job from a leading fragment of its id, as printed in
    /// logs and `jobs list`. Ambiguous prefixes resolve to nothing.
    pub async fn find_by_id_prefix(&self, prefix: &str) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE job_id::text LIKE $1
             LIMIT 2"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(like_prefix(&prefix.to_lowercase()))
            .fetch_all(self.pool())
            .await?;
        if rows.len() != 1 {
            return Ok(None);
        }
        rows.into_iter().next().map(JobRow::try_into_job).transpose()
    }
}

#[async_trait]
impl JobStore for Db {
    async fn insert(&self, job: &Job) -> Result<()> {
        // The unique constraint on job_uri is the whole deduplication story;
        // concurrent inserts of the same task race here and exactly one wins.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO jobs (job_id, kind, def, job_uri, worker_id, finished, created_at, pickups)
             VALUES ($1, $2, $3, $4, NULL, false, $5, 0)
             ON CONFLICT (job_uri) DO NOTHING
             RETURNING job_id",
        )
        .bind(job.job_id.0)
        .bind(&job.kind)
        .bind(&job.def)
        .bind(&job.job_uri)
        .bind(job.created_at)
        .fetch_optional(self.pool())
        .await?;

        match inserted {
            Some(_) => Ok(()),
            None => Err(Error::AlreadyExists(job.job_uri.clone())),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE job_id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn find_unclaimed(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE worker_id IS NULL AND NOT finished
               AND ($1::text IS NULL OR kind = $1)
               AND def @> $2
             ORDER BY created_at ASC
             LIMIT $3"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(filter.kind.as_deref())
            .bind(def_containment(filter))
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        into_jobs(rows)
    }

    async fn claim(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        // GREATEST skips NULLs, so a first claim stamps heartbeat_at = now
        // and a re-claim after release never moves it backwards.
        let sql = format!(
            "UPDATE jobs
             SET worker_id = $2,
                 started_at = COALESCE(started_at, $3),
                 heartbeat_at = GREATEST(heartbeat_at, $3),
                 pickups = pickups + 1
             WHERE job_id = $1 AND worker_id IS NULL AND NOT finished
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id.0)
            .bind(worker.as_str())
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs
             SET heartbeat_at = GREATEST(heartbeat_at, $3)
             WHERE job_id = $1 AND worker_id = $2 AND NOT finished
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id.0)
            .bind(worker.as_str())
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn finish(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        stats: &FinishStats,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs
             SET finished = true,
                 finished_at = $3,
                 time_took_ms = GREATEST(0,
                     (EXTRACT(EPOCH FROM ($3 - COALESCE(started_at, $3))) * 1000)::bigint),
                 stats = $4
             WHERE job_id = $1 AND worker_id = $2 AND NOT finished
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id.0)
            .bind(worker.as_str())
            .bind(now)
            .bind(serde_json::to_value(stats)?)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE worker_id IS NOT NULL AND NOT finished
               AND (heartbeat_at IS NULL OR heartbeat_at < $1)
             ORDER BY heartbeat_at ASC NULLS FIRST
             LIMIT $2"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        into_jobs(rows)
    }

    async fn release(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET worker_id = NULL
             WHERE job_id = $1 AND worker_id = $2 AND NOT finished
               AND (heartbeat_at IS NULL OR heartbeat_at < $3)",
        )
        .bind(job_id.0)
        .bind(worker.as_str())
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(
        &self,
        filter: &JobFilter,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR kind = $1)
               AND def @> $2
               AND CASE $3::text
                     WHEN 'unclaimed' THEN worker_id IS NULL AND NOT finished
                     WHEN 'claimed' THEN worker_id IS NOT NULL AND NOT finished
                     WHEN 'finished' THEN finished
                     ELSE true
                   END
             ORDER BY created_at DESC
             LIMIT $4"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(filter.kind.as_deref())
            .bind(def_containment(filter))
            .bind(state_name(state))
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        into_jobs(rows)
    }
}
