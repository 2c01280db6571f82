//! Metric instrument factories for bpmcrawl.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("bpmcrawl")
}

/// Counter: job creation attempts.
/// Labels: `kind`, `result` ("created" | "duplicate").
pub fn jobs_created() -> Counter<u64> {
    meter()
        .u64_counter("bpmcrawl.jobs.created")
        .with_description("Job creation attempts")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("ok" | "lost").
pub fn job_claims() -> Counter<u64> {
    meter()
        .u64_counter("bpmcrawl.jobs.claims")
        .with_description("Job claim attempts")
        .build()
}

/// Counter: heartbeats.
/// Labels: `result` ("ok" | "lost").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("bpmcrawl.jobs.heartbeats")
        .with_description("Worker heartbeats")
        .build()
}

/// Counter: finished jobs.
/// Labels: `kind`, `status` ("ok" | "failed").
pub fn jobs_finished() -> Counter<u64> {
    meter()
        .u64_counter("bpmcrawl.jobs.finished")
        .with_description("Jobs marked finished")
        .build()
}

/// Counter: stale claims released by the janitor.
pub fn stale_released() -> Counter<u64> {
    meter()
        .u64_counter("bpmcrawl.jobs.stale_released")
        .with_description("Claims released after heartbeat silence")
        .build()
}

/// Histogram: claim-to-finish duration in milliseconds.
/// Labels: `kind`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("bpmcrawl.jobs.duration_ms")
        .with_description("Job duration from claim to finish")
        .with_unit("ms")
        .build()
}
