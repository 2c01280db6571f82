//! Scheduling engine: per-invocation pick-and-run cycle, execution with
//! heartbeats, and the staleness janitor.

pub mod execution;
pub mod janitor;
pub mod scheduler;

pub use janitor::{Janitor, JanitorConfig, StalenessPolicy};
pub use scheduler::{CycleOutcome, CycleReport, Pick, Scheduler, SchedulerConfig, Submitted};
