#![forbid(unsafe_code)]

use reconq_core::{ComparisonResult, Object, Resource};
use reconq_store::EntityCache;
use serde_json::json;

fn uid() -> String { uuid::Uuid::new_v4().to_string() }

fn entity(uid: &str, spec: &str, status: &str) -> Object {
    Object::new(uid, "test-entity")
        .with_kind("TestEntity")
        .with_spec(json!({ "spec": spec }))
        .with_status(json!({ "status": status }))
}

#[test]
fn identical_upsert_is_new_then_not_modified() {
    let mut cache = EntityCache::new();
    let id = uid();
    let (_, first) = cache.upsert(entity(&id, "a", "ok"));
    let (_, second) = cache.upsert(entity(&id, "a", "ok"));
    assert_eq!(first, ComparisonResult::New);
    assert_eq!(second, ComparisonResult::NotModified);
    assert_eq!(cache.len(), 1);
}

#[test]
fn spec_change_wins_over_status_change() {
    let mut cache = EntityCache::new();
    let id = uid();
    cache.upsert(entity(&id, "a", "ok"));

    let (stored, cmp) = cache.upsert(entity(&id, "b", "ok"));
    assert_eq!(cmp, ComparisonResult::Modified);
    assert_eq!(stored.spec, json!({ "spec": "b" }));

    let (_, cmp) = cache.upsert(entity(&id, "c", "degraded"));
    assert_eq!(cmp, ComparisonResult::Modified);

    let (stored, cmp) = cache.upsert(entity(&id, "c", "ok"));
    assert_eq!(cmp, ComparisonResult::StatusModified);
    assert_eq!(stored.status, json!({ "status": "ok" }));
    assert_eq!(cache.get(&id).map(|o| o.status.clone()), Some(json!({ "status": "ok" })));
}

#[test]
fn bookkeeping_fields_do_not_count_as_changes() {
    let mut cache = EntityCache::new();
    let id = uid();
    cache.upsert(entity(&id, "a", "ok").with_resource_version("1"));
    let (stored, cmp) = cache.upsert(entity(&id, "a", "ok").with_resource_version("2"));
    assert_eq!(cmp, ComparisonResult::NotModified);
    // the newest snapshot is kept even when nothing counted as a change
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("2"));
    assert_eq!(cache.get(&id).and_then(|o| o.metadata.resource_version.clone()).as_deref(), Some("2"));
}

#[test]
fn deletion_timestamp_alone_is_not_a_change_but_is_cached() {
    let mut cache = EntityCache::new();
    let id = uid();
    cache.upsert(entity(&id, "a", "ok"));
    let ts = chrono::Utc::now();
    let (stored, cmp) = cache.upsert(entity(&id, "a", "ok").with_deletion_timestamp(ts));
    assert_eq!(cmp, ComparisonResult::NotModified);
    assert_eq!(stored.deletion_timestamp(), Some(ts));
    assert_eq!(cache.get(&id).and_then(|o| o.deletion_timestamp()), Some(ts));

    // a later re-check of the cached snapshot still sees the pending deletion
    let cached = cache.get(&id).cloned().unwrap();
    let (again, cmp) = cache.upsert(cached);
    assert_eq!(cmp, ComparisonResult::NotModified);
    assert_eq!(again.deletion_timestamp(), Some(ts));
}

#[test]
fn remove_is_idempotent_and_clear_empties() {
    let mut cache = EntityCache::new();
    let a = entity(&uid(), "a", "ok");
    let b = entity(&uid(), "b", "ok");
    cache.upsert(a.clone());
    cache.upsert(b.clone());

    assert!(cache.remove(&a).is_some());
    assert!(cache.remove(&a).is_none());
    assert!(cache.get(a.uid()).is_none());
    assert_eq!(cache.len(), 1);

    // removed identities start over as new
    let (_, cmp) = cache.upsert(a.clone());
    assert_eq!(cmp, ComparisonResult::New);

    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.get(b.uid()).is_none());
}
