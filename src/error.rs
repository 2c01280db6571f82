//! Error types for bpmcrawl.
//!
//! Variants are split by what the caller should do next: `AlreadyExists` and
//! `PickupFailed` are expected outcomes of racing workers, `LostOwnership`
//! means the current execution must stop writing, the rest are defects or
//! infrastructure failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {kind} definition: field `{field}` {reason}")]
    Validation {
        kind: String,
        field: String,
        reason: String,
    },

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported job kind: {0}")]
    UnsupportedKind(String),

    #[error("failed to pick up job {job_id}: {}", pickup_reason(.owner))]
    PickupFailed {
        job_id: String,
        owner: Option<String>,
    },

    #[error("worker {worker_id} lost ownership of job {job_id}")]
    LostOwnership { job_id: String, worker_id: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job kind registered twice: {0}")]
    DuplicateKind(String),

    #[error("job kinds expected but not registered: {0:?}")]
    MissingKinds(Vec<String>),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn pickup_reason(owner: &Option<String>) -> String {
    match owner {
        Some(owner) => format!("owned by worker {owner}"),
        None => "job vanished or was already taken".to_string(),
    }
}

impl Error {
    /// Whether the scheduling loop may carry on after this error.
    ///
    /// Store outages count as recoverable: retry policy belongs to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_) | Error::PickupFailed { .. } | Error::StoreUnavailable(_)
        )
    }

    pub(crate) fn validation(
        kind: &str,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Validation {
            kind: kind.to_string(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Other(format!("migration failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pickup_failed_names_owner() {
        let err = Error::PickupFailed {
            job_id: "j1".into(),
            owner: Some("worker-a".into()),
        };
        assert_eq!(err.to_string(), "failed to pick up job j1: owned by worker worker-a");
        assert!(err.is_recoverable());
    }

    #[test]
    fn lost_ownership_is_fatal() {
        let err = Error::LostOwnership {
            job_id: "j1".into(),
            worker_id: "w".into(),
        };
        assert!(!err.is_recoverable());
    }
}
