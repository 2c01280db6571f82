//! Job execution span helpers.

use crate::model::{JobId, WorkerId};
use tracing::Span;

/// Start a span covering one claimed job's execution.
///
/// `job.status` is declared empty and filled in when the job finishes.
pub fn start_job_span(kind: &str, job_id: JobId, worker: &WorkerId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = kind,
        "job.id" = %job_id.0,
        "job.worker" = %worker,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a lifecycle transition on `span`.
pub fn record_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
