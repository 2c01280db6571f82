//! Job URIs: deterministic, injective, and independent of field order.

use bpmcrawl::kinds;
use bpmcrawl::kinds::calc_bpm::FixedAnalyzer;
use bpmcrawl::model::{JobRequest, Service};
use bpmcrawl::registry::JobRegistry;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn registry() -> JobRegistry {
    kinds::registry(Arc::new(FixedAnalyzer::default())).unwrap()
}

fn service() -> impl Strategy<Value = Service> {
    prop::sample::select(Service::ALL.to_vec())
}

#[test]
fn builtin_kinds_are_registered() {
    let registry = registry();
    assert_eq!(registry.kinds(), vec!["calc_bpm"]);
    assert!(registry.ensure_kinds(kinds::BUILTIN_KINDS).is_ok());
}

#[test]
fn field_order_does_not_change_uri() {
    let registry = registry();
    let a = json!({"user": "u1", "service": "spotify", "track_id": "9"});
    let b: serde_json::Value =
        serde_json::from_str(r#"{"track_id": "9", "service": "spotify", "user": "u1"}"#).unwrap();
    assert_eq!(
        registry.uri("calc_bpm", &a).unwrap(),
        registry.uri("calc_bpm", &b).unwrap()
    );
}

#[test]
fn unicode_fields_are_escaped() {
    let registry = registry();
    let uri = registry
        .uri(
            "calc_bpm",
            &json!({"user": "Мария", "service": "yandexmusic", "track_id": "a b"}),
        )
        .unwrap();
    assert!(uri.is_ascii());
    assert!(uri.ends_with("/yandexmusic/a%20b"));
}

proptest! {
    #[test]
    fn uri_is_pure(user in ".{1,24}", svc in service(), track in ".{1,24}") {
        let registry = registry();
        let request = JobRequest::calc_bpm(user, svc, track);
        let first = registry.construct(&request).unwrap();
        let second = registry.construct(&request).unwrap();
        prop_assert_eq!(&first.job_uri, &second.job_uri);
        prop_assert_eq!(registry.uri("calc_bpm", &first.def).unwrap(), first.job_uri);
    }

    #[test]
    fn uri_has_exactly_four_segments(user in ".{1,24}", svc in service(), track in ".{1,24}") {
        let uri = registry()
            .construct(&JobRequest::calc_bpm(user, svc, track))
            .unwrap()
            .job_uri;
        prop_assert_eq!(uri.split('/').count(), 4);
    }

    #[test]
    fn different_tracks_never_collide(
        u1 in "[a-z/%]{1,8}", t1 in "[0-9/%]{1,8}",
        u2 in "[a-z/%]{1,8}", t2 in "[0-9/%]{1,8}",
        svc in service(),
    ) {
        prop_assume!((&u1, &t1) != (&u2, &t2));
        let registry = registry();
        let a = registry.construct(&JobRequest::calc_bpm(u1, svc, t1)).unwrap();
        let b = registry.construct(&JobRequest::calc_bpm(u2, svc, t2)).unwrap();
        prop_assert_ne!(a.job_uri, b.job_uri);
    }
}
