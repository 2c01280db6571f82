//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `secrecy::SecretString` so it
//! never ends up in logs.

use crate::engine::{JanitorConfig, SchedulerConfig, StalenessPolicy};
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ANALYZER_CMD: &str = "bpm-analyze";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub staleness: StalenessPolicy,
    pub janitor_interval: Duration,
    /// External tempo analysis program for `calc_bpm`, looked up on `PATH`
    /// unless absolute.
    pub analyzer_cmd: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let heartbeat = Duration::from_secs(secs_var("BPMCRAWL_HEARTBEAT_SECS", 30)?);
        let stale_after = Duration::from_secs(secs_var("BPMCRAWL_STALE_AFTER_SECS", 180)?);

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            staleness: StalenessPolicy::new(heartbeat, stale_after)?,
            janitor_interval: Duration::from_secs(secs_var("BPMCRAWL_JANITOR_INTERVAL_SECS", 60)?),
            analyzer_cmd: optional_var("BPMCRAWL_ANALYZER_CMD")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ANALYZER_CMD)),
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            heartbeat_interval: self.staleness.heartbeat_interval(),
            ..SchedulerConfig::default()
        }
    }

    pub fn janitor(&self) -> JanitorConfig {
        JanitorConfig::new(self.staleness, self.janitor_interval)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn secs_var(name: &str, default: u64) -> Result<u64> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds, got {raw:?}"))),
    }
}
