//! Job type registry.
//!
//! Maps a job `kind` string to the type that knows how to validate its
//! definition, derive its URI, and execute it. This is the only place that
//! dispatches on `kind`.

use crate::error::{Error, Result};
use crate::job::JobContext;
use crate::model::JobRequest;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One kind of job.
#[async_trait]
pub trait JobType: Send + Sync {
    /// The `kind` tag this type answers to.
    fn kind(&self) -> &'static str;

    /// Check a raw definition, returning the normalized one or a
    /// `Validation` error naming the first bad field.
    fn validate(&self, def: &Value) -> Result<Value>;

    /// Deterministic URI of a validated definition. Must be injective:
    /// two different definitions never share a URI.
    fn uri(&self, def: &Value) -> Result<String>;

    /// Do the work. Long executions should call `ctx.heartbeat()` and stop on
    /// `LostOwnership`.
    async fn execute(&self, ctx: &JobContext) -> Result<Option<Value>>;
}

/// A request that passed validation, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub kind: String,
    pub def: Value,
    pub job_uri: String,
}

/// Registry of job types, indexed by kind.
///
/// Built at startup, read-only afterwards.
#[derive(Default, Clone)]
pub struct JobRegistry {
    types: HashMap<String, Arc<dyn JobType>>,
}

impl JobRegistry {
    /// Create an empty registry with no job types.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a job type. A kind can only be registered once.
    pub fn register(&mut self, job_type: Arc<dyn JobType>) -> Result<()> {
        let kind = job_type.kind().to_string();
        if self.types.contains_key(&kind) {
            return Err(Error::DuplicateKind(kind));
        }
        self.types.insert(kind, job_type);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, job_type: Arc<dyn JobType>) -> Result<Self> {
        self.register(job_type)?;
        Ok(self)
    }

    /// Fail fast if any of `kinds` has no registered type.
    pub fn ensure_kinds(&self, kinds: &[&str]) -> Result<()> {
        let missing: Vec<String> = kinds
            .iter()
            .filter(|k| !self.types.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingKinds(missing))
        }
    }

    /// Look up a job type by kind.
    pub fn get(&self, kind: &str) -> Result<&Arc<dyn JobType>> {
        self.types
            .get(kind)
            .ok_or_else(|| Error::UnsupportedKind(kind.to_string()))
    }

    /// Validate a request and derive its URI.
    pub fn construct(&self, request: &JobRequest) -> Result<ValidatedJob> {
        let job_type = self.get(&request.kind)?;
        let def = job_type.validate(&request.def)?;
        let job_uri = job_type.uri(&def)?;
        Ok(ValidatedJob {
            kind: request.kind.clone(),
            def,
            job_uri,
        })
    }

    /// URI of a `(kind, def)` pair, validating on the way.
    pub fn uri(&self, kind: &str, def: &Value) -> Result<String> {
        let job_type = self.get(kind)?;
        job_type.uri(&job_type.validate(def)?)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.types.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Fetch a required, non-empty string field from a definition.
pub fn required_str<'a>(kind: &str, def: &'a Value, field: &str) -> Result<&'a str> {
    match def.get(field) {
        None | Some(Value::Null) => Err(Error::validation(kind, field, "is missing")),
        Some(Value::String(s)) if s.is_empty() => Err(Error::validation(kind, field, "is empty")),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(Error::validation(kind, field, "must be a string")),
    }
}
