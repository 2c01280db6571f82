//! Core data model.
//!
//! A job is one analysis task shared between crawler processes. Its identity
//! is `(kind, def)`, reduced to a deterministic `job_uri` that the store keeps
//! unique. Ownership lives in `worker_id`; everything else is bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for job IDs (store primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identity of one worker process. Doubles as the fencing token once a job
/// is claimed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Fresh random worker identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Music services
// ---------------------------------------------------------------------------

/// Music services a track can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Gmusic,
    Spotify,
    Yandexmusic,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Gmusic, Service::Spotify, Service::Yandexmusic];

    pub fn as_str(self) -> &'static str {
        match self {
            Service::Gmusic => "gmusic",
            Service::Spotify => "spotify",
            Service::Yandexmusic => "yandexmusic",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|svc| svc.as_str() == s)
            .ok_or_else(|| format!("unknown service: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request to have some task done. Wire shape: `{"kind": ..., "def": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: String,
    pub def: Value,
}

impl JobRequest {
    pub fn new(kind: impl Into<String>, def: Value) -> Self {
        Self {
            kind: kind.into(),
            def,
        }
    }

    /// Request a tempo histogram for one track of one user.
    pub fn calc_bpm(user: impl Into<String>, service: Service, track_id: impl Into<String>) -> Self {
        Self::new(
            crate::kinds::calc_bpm::KIND,
            serde_json::json!({
                "user": user.into(),
                "service": service.as_str(),
                "track_id": track_id.into(),
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Job row
// ---------------------------------------------------------------------------

/// One persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub kind: String,
    /// Validated, immutable definition.
    pub def: Value,
    /// Deduplication key, pure function of `(kind, def)`.
    pub job_uri: String,
    /// Current owner. `None` means unclaimed.
    pub worker_id: Option<WorkerId>,
    pub finished: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub time_took_ms: Option<u64>,
    pub stats: Option<FinishStats>,
    /// Number of successful claims, > 1 after staleness reclaims.
    pub pickups: u32,
}

impl Job {
    pub(crate) fn new(kind: &str, def: Value, job_uri: String, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            kind: kind.to_string(),
            def,
            job_uri,
            worker_id: None,
            finished: false,
            created_at: now,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            time_took_ms: None,
            stats: None,
            pickups: 0,
        }
    }

    pub fn state(&self) -> JobState {
        match (&self.worker_id, self.finished) {
            (_, true) => JobState::Finished,
            (Some(_), false) => JobState::Claimed,
            (None, false) => JobState::Unclaimed,
        }
    }

    pub fn time_took(&self) -> Option<std::time::Duration> {
        self.time_took_ms.map(std::time::Duration::from_millis)
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.worker_id.as_ref() == Some(worker)
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.worker_id {
            None => write!(f, "job({}, {})", self.job_id, self.job_uri),
            Some(w) => write!(f, "job({}, {}, worker={w})", self.job_id, self.job_uri),
        }
    }
}

/// Lifecycle state, derived from `worker_id` and `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unclaimed,
    Claimed,
    Finished,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Unclaimed => "unclaimed",
            JobState::Claimed => "claimed",
            JobState::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unclaimed" => Ok(JobState::Unclaimed),
            "claimed" => Ok(JobState::Claimed),
            "finished" => Ok(JobState::Finished),
            _ => Err(format!("unknown job state: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Finish statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ok,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
        })
    }
}

/// Execution statistics recorded by `finish()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishStats {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Executor output. Opaque to the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FinishStats {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: JobStatus::Ok,
            error: None,
            data,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error.into()),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Selects jobs by kind and by exact string values of definition fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub kind: Option<String>,
    pub def: Map<String, Value>,
}

impl JobFilter {
    /// Matches every job.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn def_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.def.insert(field.into(), Value::String(value.into()));
        self
    }

    pub fn service(self, service: Service) -> Self {
        self.def_field("service", service.as_str())
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ref kind) = self.kind
            && kind != &job.kind
        {
            return false;
        }
        self.def
            .iter()
            .all(|(field, value)| job.def.get(field) == Some(value))
    }
}
