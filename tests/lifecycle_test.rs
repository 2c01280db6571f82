//! Job lifecycle scenarios against the in-memory store with a manual clock.

use bpmcrawl::clock::{Clock, ManualClock};
use bpmcrawl::engine::{Janitor, JanitorConfig, StalenessPolicy};
use bpmcrawl::error::Error;
use bpmcrawl::job::Jobs;
use bpmcrawl::kinds;
use bpmcrawl::kinds::calc_bpm::FixedAnalyzer;
use bpmcrawl::model::{FinishStats, JobRequest, JobState, JobStatus, Service, WorkerId};
use bpmcrawl::store::MemoryJobStore;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

struct Harness {
    jobs: Jobs,
    store: Arc<MemoryJobStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryJobStore::new());
    let registry = kinds::registry(Arc::new(FixedAnalyzer::default())).unwrap();
    let jobs = Jobs::new(store.clone(), Arc::new(registry)).with_clock(clock.clone());
    Harness { jobs, store, clock }
}

fn janitor(h: &Harness, heartbeat_secs: u64, stale_secs: u64) -> Janitor {
    let policy = StalenessPolicy::new(
        std::time::Duration::from_secs(heartbeat_secs),
        std::time::Duration::from_secs(stale_secs),
    )
    .unwrap();
    Janitor::new(
        h.store.clone(),
        JanitorConfig::new(policy, std::time::Duration::from_secs(1)),
    )
    .with_clock(h.clock.clone())
}

fn track() -> JobRequest {
    JobRequest::calc_bpm("u1", Service::Yandexmusic, "123")
}

#[tokio::test]
async fn create_twice_reports_already_exists() {
    let h = harness();
    let request = JobRequest::new(
        "calc_bpm",
        json!({"user": "u1", "service": "yandexmusic", "track_id": "123"}),
    );

    let job = h.jobs.create(&request).await.unwrap();
    assert_eq!(job.job_uri, "calc_bpm/u1/yandexmusic/123");
    assert_eq!(job.state(), JobState::Unclaimed);

    let err = h.jobs.create(&request).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref uri) if uri == "calc_bpm/u1/yandexmusic/123"));
    assert!(err.is_recoverable());
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn create_rejects_first_missing_field() {
    let h = harness();
    let err = h
        .jobs
        .create(&JobRequest::new("calc_bpm", json!({"service": "spotify"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "user"));

    let err = h
        .jobs
        .create(&JobRequest::new(
            "calc_bpm",
            json!({"user": "u1", "service": "napster", "track_id": "1"}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "service"));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn create_unknown_kind_is_unsupported() {
    let h = harness();
    let err = h
        .jobs
        .create(&JobRequest::new("calc_key", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedKind(ref k) if k == "calc_key"));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn second_worker_claim_reports_owner() {
    let h = harness();
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    let b = WorkerId::from("B");

    let claimed = h.jobs.claim(job.job_id, &a).await.unwrap();
    assert_eq!(claimed.job().worker_id.as_ref(), Some(&a));

    let err = h.jobs.claim(job.job_id, &b).await.unwrap_err();
    assert!(matches!(err, Error::PickupFailed { owner: Some(ref o), .. } if o == "A"));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn janitor_releases_silent_job_after_threshold() {
    let h = harness();
    let janitor = janitor(&h, 20, 60);
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    let c = WorkerId::from("C");

    let t0 = h.clock.now();
    h.jobs.claim(job.job_id, &a).await.unwrap();

    h.clock.advance(Duration::seconds(60));
    assert!(janitor.sweep_once().await.unwrap().is_empty());
    assert!(h.jobs.claim(job.job_id, &c).await.is_err());

    h.clock.advance(Duration::seconds(1));
    let released = janitor.sweep_once().await.unwrap();
    assert_eq!(released, vec![job.job_id]);
    assert_eq!(h.jobs.get(job.job_id).await.unwrap().state(), JobState::Unclaimed);

    let claimed = h.jobs.claim(job.job_id, &c).await.unwrap();
    assert_eq!(claimed.job().worker_id.as_ref(), Some(&c));
    assert_eq!(claimed.job().pickups, 2);
    // Execution time keeps counting from the first claim.
    assert_eq!(claimed.job().started_at, Some(t0));
    assert_eq!(claimed.job().heartbeat_at, Some(h.clock.now()));
}

#[tokio::test]
async fn janitor_spares_heartbeating_job() {
    let h = harness();
    let janitor = janitor(&h, 20, 60);
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    let mut claimed = h.jobs.claim(job.job_id, &a).await.unwrap();

    for _ in 0..10 {
        h.clock.advance(Duration::seconds(20));
        claimed.heartbeat().await.unwrap();
        assert!(janitor.sweep_once().await.unwrap().is_empty());
    }
    assert_eq!(h.jobs.get(job.job_id).await.unwrap().worker_id, Some(a));
}

#[tokio::test]
async fn janitor_leaves_finished_jobs_alone() {
    let h = harness();
    let janitor = janitor(&h, 20, 60);
    let job = h.jobs.create(&track()).await.unwrap();
    let claimed = h.jobs.claim(job.job_id, &WorkerId::from("A")).await.unwrap();
    claimed.finish(FinishStats::ok(None)).await.unwrap();

    h.clock.advance(Duration::hours(1));
    assert!(janitor.sweep_once().await.unwrap().is_empty());
    assert_eq!(h.jobs.get(job.job_id).await.unwrap().state(), JobState::Finished);
}

#[tokio::test]
async fn heartbeats_for_five_minutes_then_finish() {
    let h = harness();
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    let mut claimed = h.jobs.claim(job.job_id, &a).await.unwrap();

    for _ in 0..30 {
        h.clock.advance(Duration::seconds(10));
        claimed.heartbeat().await.unwrap();
    }
    assert_eq!(claimed.job().heartbeat_at, Some(h.clock.now()));

    let done = claimed
        .finish(FinishStats::ok(Some(json!({"histogram": {"120": 1.0}}))))
        .await
        .unwrap();
    assert!(done.finished);
    assert_eq!(done.state(), JobState::Finished);
    assert_eq!(done.time_took_ms, Some(300_000));
    assert_eq!(done.finished_at, Some(h.clock.now()));
    assert_eq!(done.stats.as_ref().map(|s| s.status), Some(JobStatus::Ok));

    let err = h
        .jobs
        .claim(job.job_id, &WorkerId::from("Z"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PickupFailed { .. }));
}

#[tokio::test]
async fn finish_by_wrong_worker_changes_nothing() {
    let h = harness();
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    h.jobs.claim(job.job_id, &a).await.unwrap();
    let before = h.jobs.get(job.job_id).await.unwrap();

    h.clock.advance(Duration::seconds(5));
    let err = h
        .jobs
        .finish(job.job_id, &WorkerId::from("B"), FinishStats::ok(None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LostOwnership { ref worker_id, .. } if worker_id == "B"));
    assert!(!err.is_recoverable());
    assert_eq!(h.jobs.get(job.job_id).await.unwrap(), before);
}

#[tokio::test]
async fn finish_twice_is_lost_ownership() {
    let h = harness();
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    h.jobs.claim(job.job_id, &a).await.unwrap();
    h.jobs
        .finish(job.job_id, &a, FinishStats::failed("boom"))
        .await
        .unwrap();

    let err = h
        .jobs
        .finish(job.job_id, &a, FinishStats::ok(None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LostOwnership { .. }));
    let row = h.jobs.get(job.job_id).await.unwrap();
    assert_eq!(row.stats, Some(FinishStats::failed("boom")));
}

#[tokio::test]
async fn released_owner_cannot_write_back() {
    let h = harness();
    let janitor = janitor(&h, 10, 30);
    let job = h.jobs.create(&track()).await.unwrap();
    let a = WorkerId::from("A");
    let mut stale = h.jobs.claim(job.job_id, &a).await.unwrap();

    h.clock.advance(Duration::seconds(31));
    janitor.sweep_once().await.unwrap();
    h.jobs.claim(job.job_id, &WorkerId::from("C")).await.unwrap();

    assert!(matches!(
        stale.heartbeat().await.unwrap_err(),
        Error::LostOwnership { .. }
    ));
    assert!(matches!(
        stale.finish(FinishStats::ok(None)).await.unwrap_err(),
        Error::LostOwnership { .. }
    ));
    let row = h.jobs.get(job.job_id).await.unwrap();
    assert_eq!(row.worker_id, Some(WorkerId::from("C")));
    assert!(!row.finished);
}
