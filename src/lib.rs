//! # bpmcrawl
//!
//! Distributed job queue for BPM crawler workers.
//!
//! Jobs live in a shared store (Postgres in production). Any number of
//! worker invocations on any number of hosts pick up work concurrently; the
//! only coordination is the store's unique `job_uri` constraint and its
//! atomic conditional updates. A staleness janitor returns jobs whose
//! worker stopped heartbeating.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod kinds;
pub mod model;
pub mod registry;
pub mod store;
pub mod telemetry;
