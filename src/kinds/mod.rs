//! Built-in job kinds.

pub mod calc_bpm;

use crate::error::Result;
use crate::registry::JobRegistry;
use calc_bpm::{CalcBpm, TrackAnalyzer};
use std::sync::Arc;

/// Kinds every worker is expected to handle.
pub const BUILTIN_KINDS: &[&str] = &[calc_bpm::KIND];

/// Registry with all built-in kinds, checked for completeness.
pub fn registry(analyzer: Arc<dyn TrackAnalyzer>) -> Result<JobRegistry> {
    let registry = JobRegistry::empty().with(Arc::new(CalcBpm::new(analyzer)))?;
    registry.ensure_kinds(BUILTIN_KINDS)?;
    Ok(registry)
}
