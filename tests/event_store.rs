//! Event Store Integration Tests
//!
//! Tests for state-change diffing, reduction order and the JSONL store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use covorch::core::{
    EventStateService, EventStore, EventStoreError, EventStoreService, JsonlEventStore,
};
use covorch::domain::{
    CommitIdentity, EventStateChange, EventStateChangeCollection, IngestionEvent, JobEvent,
    OrchestratedEvent, OrchestratedEventState, OrchestratedEventType, StateChangeFields,
};

fn commit() -> CommitIdentity {
    CommitIdentity::new("github", "owner", "repo", "main", "abc123")
}

fn job(state: OrchestratedEventState, index: Option<u32>) -> OrchestratedEvent {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    OrchestratedEvent::Job(JobEvent {
        identity: commit(),
        external_id: "job-1".to_string(),
        name: Some("unit-tests".to_string()),
        state,
        index,
        created_at: at,
        updated_at: at,
    })
}

fn fields(value: Value) -> StateChangeFields {
    value.as_object().cloned().unwrap()
}

fn change(version: u64, event_type: OrchestratedEventType, value: Value) -> EventStateChange {
    EventStateChange::new("key", version, event_type, fields(value))
}

#[test]
fn test_diff_contains_exactly_changed_fields() {
    let service = EventStoreService::new();
    let before = job(OrchestratedEventState::Ongoing, None);
    let after = job(OrchestratedEventState::Ongoing, Some(3));

    let diff = service.get_state_change(Some(&before), &after).unwrap();
    assert_eq!(diff, fields(json!({ "index": 3 })));

    let same = service.get_state_change(Some(&after), &after).unwrap();
    assert!(same.is_empty());
}

#[test]
fn test_diff_with_no_base_is_full_field_set() {
    let service = EventStoreService::new();
    let event = job(OrchestratedEventState::Ongoing, None);

    let diff = service.get_state_change(None, &event).unwrap();

    assert_eq!(diff.get("type"), Some(&json!("job")));
    assert_eq!(diff.get("external_id"), Some(&json!("job-1")));
    assert_eq!(diff.get("state"), Some(&json!("ongoing")));
    assert_eq!(diff, event.to_fields().unwrap());
}

#[test]
fn test_diff_type_mismatch_is_invalid_state() {
    let service = EventStoreService::new();
    let at = Utc::now();
    let ingestion = OrchestratedEvent::Ingestion(IngestionEvent {
        identity: commit(),
        upload_id: "upload-1".to_string(),
        state: OrchestratedEventState::Ongoing,
        created_at: at,
        updated_at: at,
    });

    let err = service
        .get_state_change(Some(&job(OrchestratedEventState::Ongoing, None)), &ingestion)
        .unwrap_err();
    assert!(matches!(err, EventStoreError::InvalidState { .. }));
}

#[test]
fn test_reduction_overlays_in_order() {
    let service = EventStoreService::new();
    let changes = vec![
        change(1, OrchestratedEventType::Job, json!({ "a": 1 })),
        change(2, OrchestratedEventType::Job, json!({ "a": 2, "b": 1 })),
        change(3, OrchestratedEventType::Job, json!({ "b": 2 })),
    ];

    let (_, merged) = service.merge_state_changes(&changes).unwrap();
    assert_eq!(merged, fields(json!({ "a": 2, "b": 2 })));

    let (_, reversed) = service.merge_state_changes(changes.iter().rev()).unwrap();
    assert_eq!(reversed, fields(json!({ "a": 1, "b": 1 })));
}

#[test]
fn test_reduction_skips_foreign_types() {
    let service = EventStoreService::new();
    let changes = vec![
        change(1, OrchestratedEventType::Job, json!({ "a": 1 })),
        change(2, OrchestratedEventType::Ingestion, json!({ "a": 99, "c": 5 })),
        change(3, OrchestratedEventType::Job, json!({ "b": 2 })),
    ];

    let (event_type, merged) = service.merge_state_changes(&changes).unwrap();
    assert_eq!(event_type, OrchestratedEventType::Job);
    assert_eq!(merged, fields(json!({ "a": 1, "b": 2 })));
}

#[test]
fn test_concurrent_writers_reduce_to_latest_state() {
    let service = EventStoreService::new();
    let first = job(OrchestratedEventState::Ongoing, None).to_fields().unwrap();

    let collection = Arc::new(EventStateChangeCollection::new(vec![
        EventStateChange::new("key", 1, OrchestratedEventType::Job, first),
        change(2, OrchestratedEventType::Job, json!({ "state": "ongoing", "index": 1 })),
        change(3, OrchestratedEventType::Job, json!({ "state": "success" })),
    ]));

    let event = service
        .reduce_state_changes_to_event(&collection)
        .unwrap()
        .unwrap();

    assert_eq!(event.state(), OrchestratedEventState::Success);
    match event {
        OrchestratedEvent::Job(job) => assert_eq!(job.index, Some(1)),
        other => panic!("expected job event, got {:?}", other),
    }
}

#[test]
fn test_reduction_round_trips_recorded_diffs() {
    let service = EventStoreService::new();
    let v1 = job(OrchestratedEventState::Ongoing, None);
    let v2 = job(OrchestratedEventState::Ongoing, Some(2));
    let v3 = job(OrchestratedEventState::Failure, Some(2));

    let diffs = [
        service.get_state_change(None, &v1).unwrap(),
        service.get_state_change(Some(&v1), &v2).unwrap(),
        service.get_state_change(Some(&v2), &v3).unwrap(),
    ];
    let changes: Vec<EventStateChange> = diffs
        .into_iter()
        .zip(1..)
        .map(|(diff, version)| {
            EventStateChange::new("key", version, OrchestratedEventType::Job, diff)
        })
        .collect();

    let reduced = service.reduce_state_changes(&changes).unwrap();
    assert_eq!(reduced, Some(v3));
}

#[test]
fn test_reduction_missing_identity_fails() {
    let service = EventStoreService::new();
    let changes = vec![change(1, OrchestratedEventType::Ingestion, json!({ "state": "success" }))];

    let err = service.reduce_state_changes(&changes).unwrap_err();
    assert!(matches!(
        err,
        EventStoreError::Deserialization {
            event_type: OrchestratedEventType::Ingestion,
            ..
        }
    ));
}

#[tokio::test]
async fn test_jsonl_store_round_trip_through_reduction() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonlEventStore::open(temp_dir.path()).await.unwrap();
    let service = EventStoreService::new();

    let v1 = job(OrchestratedEventState::Ongoing, None);
    let v2 = job(OrchestratedEventState::Success, Some(1));
    let key = v1.event_key();

    let first = service.get_state_change(None, &v1).unwrap();
    let second = service.get_state_change(Some(&v1), &v2).unwrap();
    for (version, diff) in [(1, first), (2, second)] {
        let change =
            EventStateChange::new(key.to_string(), version, OrchestratedEventType::Job, diff);
        store.append_state_change(&key, &change).await.unwrap();
    }

    // The log is plain JSONL, one change per line
    let content = std::fs::read_to_string(store.events_path(&key)).unwrap();
    assert_eq!(content.lines().count(), 2);

    let collection = store.list_state_changes(&key).await.unwrap();
    let reduced = service.reduce_state_changes_to_event(&collection).unwrap();
    assert_eq!(reduced, Some(v2));
}
