//! `calc_bpm`: compute the tempo histogram of one track.
//!
//! Definition: `{"user": ..., "service": "gmusic"|"spotify"|"yandexmusic", "track_id": ...}`.
//! URI: `calc_bpm/{user}/{service}/{track_id}` with every field percent-escaped,
//! so a `/` inside a field cannot forge another job's URI.
//!
//! Downloading and analyzing audio happen behind [`TrackAnalyzer`].

use crate::error::{Error, Result};
use crate::job::JobContext;
use crate::model::Service;
use crate::registry::{JobType, required_str};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const KIND: &str = "calc_bpm";

/// Tempo histogram: BPM -> share of beats.
pub type Histogram = BTreeMap<u32, f64>;

/// Fetches a track and measures its tempo distribution.
#[async_trait]
pub trait TrackAnalyzer: Send + Sync {
    async fn analyze(&self, user: &str, service: Service, track_id: &str) -> Result<Histogram>;
}

pub struct CalcBpm {
    analyzer: Arc<dyn TrackAnalyzer>,
}

impl CalcBpm {
    pub fn new(analyzer: Arc<dyn TrackAnalyzer>) -> Self {
        Self { analyzer }
    }
}

/// Typed view of a validated definition.
struct TrackRef<'a> {
    user: &'a str,
    service: Service,
    track_id: &'a str,
}

fn parse(def: &Value) -> Result<TrackRef<'_>> {
    let user = required_str(KIND, def, "user")?;
    let service = required_str(KIND, def, "service")?
        .parse::<Service>()
        .map_err(|_| {
            Error::validation(KIND, "service", "must be one of gmusic, spotify, yandexmusic")
        })?;
    let track_id = required_str(KIND, def, "track_id")?;
    Ok(TrackRef {
        user,
        service,
        track_id,
    })
}

#[async_trait]
impl JobType for CalcBpm {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn validate(&self, def: &Value) -> Result<Value> {
        let track = parse(def)?;
        Ok(json!({
            "user": track.user,
            "service": track.service.as_str(),
            "track_id": track.track_id,
        }))
    }

    fn uri(&self, def: &Value) -> Result<String> {
        let track = parse(def)?;
        Ok(format!(
            "{KIND}/{}/{}/{}",
            urlencoding::encode(track.user),
            urlencoding::encode(track.service.as_str()),
            urlencoding::encode(track.track_id),
        ))
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Option<Value>> {
        let track = parse(ctx.def())?;
        let start = Instant::now();

        let histogram = self
            .analyzer
            .analyze(track.user, track.service, track.track_id)
            .await?;
        // Analysis can take minutes; prove we are still the owner before reporting.
        // Any other heartbeat failure is transient and must not cost the result.
        match ctx.heartbeat().await {
            Ok(()) => {}
            Err(e @ Error::LostOwnership { .. }) => return Err(e),
            Err(e) => warn!(track_id = track.track_id, "heartbeat after analysis failed: {e}"),
        }

        info!(
            service = %track.service,
            track_id = track.track_id,
            bins = histogram.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "track analyzed"
        );
        Ok(Some(json!({ "histogram": histogram })))
    }
}

// ---------------------------------------------------------------------------
// Analyzers
// ---------------------------------------------------------------------------

/// Runs an external program: `<command> <service> <track_id> <user>`.
///
/// The program must print a JSON object `{"<bpm>": <share>, ...}` on stdout
/// and exit 0.
pub struct CommandAnalyzer {
    command: PathBuf,
}

impl CommandAnalyzer {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TrackAnalyzer for CommandAnalyzer {
    async fn analyze(&self, user: &str, service: Service, track_id: &str) -> Result<Histogram> {
        debug!(command = %self.command.display(), %service, track_id, "running analyzer");
        let output = Command::new(&self.command)
            .arg(service.as_str())
            .arg(track_id)
            .arg(user)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Execution(format!(
                "analyzer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Execution(format!("analyzer printed a bad histogram: {e}")))
    }
}

/// Returns the same histogram for every track. For dry runs and tests.
#[derive(Debug, Clone)]
pub struct FixedAnalyzer {
    histogram: Histogram,
}

impl FixedAnalyzer {
    pub fn new(histogram: Histogram) -> Self {
        Self { histogram }
    }
}

impl Default for FixedAnalyzer {
    fn default() -> Self {
        Self::new(BTreeMap::from([(90, 0.9), (181, 0.1)]))
    }
}

#[async_trait]
impl TrackAnalyzer for FixedAnalyzer {
    async fn analyze(&self, _user: &str, _service: Service, _track_id: &str) -> Result<Histogram> {
        Ok(self.histogram.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> CalcBpm {
        CalcBpm::new(Arc::new(FixedAnalyzer::default()))
    }

    #[test]
    fn uri_plain_fields() {
        let def = json!({"user": "u1", "service": "yandexmusic", "track_id": "123"});
        assert_eq!(calc().uri(&def).unwrap(), "calc_bpm/u1/yandexmusic/123");
    }

    #[test]
    fn uri_escapes_delimiters() {
        let a = json!({"user": "a/b", "service": "spotify", "track_id": "c"});
        let b = json!({"user": "a", "service": "spotify", "track_id": "b/c"});
        let ua = calc().uri(&a).unwrap();
        assert_eq!(ua, "calc_bpm/a%2Fb/spotify/c");
        assert_ne!(ua, calc().uri(&b).unwrap());
    }

    #[test]
    fn validate_reports_first_missing_field() {
        let err = calc().validate(&json!({"service": "spotify"})).unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "user"));

        let err = calc()
            .validate(&json!({"user": "u", "service": "spotify"}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "track_id"));
    }

    #[test]
    fn validate_rejects_unknown_service() {
        let err = calc()
            .validate(&json!({"user": "u", "service": "deezer", "track_id": "1"}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field, .. } if field == "service"));
    }

    #[test]
    fn histogram_round_trips_with_string_keys() {
        let parsed: Histogram = serde_json::from_str(r#"{"90": 0.9, "181": 0.1}"#).unwrap();
        assert_eq!(parsed, FixedAnalyzer::default().histogram);
    }
}
