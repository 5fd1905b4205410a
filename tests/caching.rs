//! Reduction Cache Integration Tests
//!
//! The cache is keyed by collection instance: the same `Arc` is reduced
//! once, a different instance is always reduced again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;

use covorch::core::{
    CachingEventStoreService, EventStateService, EventStoreError, EventStoreService,
};
use covorch::domain::{
    CommitIdentity, EventStateChange, EventStateChangeCollection, JobEvent, OrchestratedEvent,
    OrchestratedEventState, OrchestratedEventType, StateChangeFields,
};

/// Counts calls into the wrapped service
#[derive(Default)]
struct CountingService {
    inner: EventStoreService,
    diffs: AtomicUsize,
    reductions: AtomicUsize,
}

impl EventStateService for CountingService {
    fn get_state_change_for_event(
        &self,
        current_state: Option<&OrchestratedEvent>,
        new_state: &OrchestratedEvent,
    ) -> Result<StateChangeFields, EventStoreError> {
        self.diffs.fetch_add(1, Ordering::SeqCst);
        self.inner.get_state_change_for_event(current_state, new_state)
    }

    fn reduce_state_changes_to_event(
        &self,
        collection: &Arc<EventStateChangeCollection>,
    ) -> Result<Option<OrchestratedEvent>, EventStoreError> {
        self.reductions.fetch_add(1, Ordering::SeqCst);
        self.inner.reduce_state_changes_to_event(collection)
    }
}

fn job(state: OrchestratedEventState) -> OrchestratedEvent {
    let now = Utc::now();
    OrchestratedEvent::Job(JobEvent {
        identity: CommitIdentity::new("github", "owner", "repo", "main", "abc123"),
        external_id: "job-1".to_string(),
        name: None,
        state,
        index: None,
        created_at: now,
        updated_at: now,
    })
}

fn collection() -> Arc<EventStateChangeCollection> {
    let event = job(OrchestratedEventState::Ongoing);
    Arc::new(EventStateChangeCollection::new(vec![EventStateChange::new(
        event.event_key().to_string(),
        1,
        OrchestratedEventType::Job,
        event.to_fields().unwrap(),
    )]))
}

#[test]
fn test_same_collection_reduced_once() {
    let service = CachingEventStoreService::new(CountingService::default());
    let collection_x = collection();

    let first = service.reduce_state_changes_to_event(&collection_x).unwrap();
    let second = service.reduce_state_changes_to_event(&collection_x).unwrap();

    assert_eq!(first, second);
    assert!(first.is_some());
    assert_eq!(service.inner().reductions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_equal_contents_different_instance_is_a_miss() {
    let service = CachingEventStoreService::new(CountingService::default());
    let collection_x = collection();
    let collection_y = Arc::new((*collection_x).clone());
    assert_eq!(*collection_x, *collection_y);

    service.reduce_state_changes_to_event(&collection_x).unwrap();
    service.reduce_state_changes_to_event(&collection_y).unwrap();
    service.reduce_state_changes_to_event(&collection_x).unwrap();

    assert_eq!(service.inner().reductions.load(Ordering::SeqCst), 2);
    assert_eq!(service.cached_len(), 2);
}

#[test]
fn test_diff_is_never_cached() {
    let service = CachingEventStoreService::new(CountingService::default());
    let current = job(OrchestratedEventState::Ongoing);
    let new = job(OrchestratedEventState::Success);

    service.get_state_change_for_event(Some(&current), &new).unwrap();
    service.get_state_change_for_event(Some(&current), &new).unwrap();

    assert_eq!(service.inner().diffs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_entries_released_with_collection() {
    let service = CachingEventStoreService::new(CountingService::default());

    {
        let scoped = collection();
        service.reduce_state_changes_to_event(&scoped).unwrap();
        assert_eq!(service.cached_len(), 1);
    }

    assert_eq!(service.cached_len(), 0);
}

#[test]
fn test_failed_reduction_not_cached() {
    let service = CachingEventStoreService::new(CountingService::default());
    let broken = Arc::new(EventStateChangeCollection::new(vec![EventStateChange::new(
        "key",
        1,
        OrchestratedEventType::Job,
        StateChangeFields::new(),
    )]));

    assert!(service.reduce_state_changes_to_event(&broken).is_err());
    assert!(service.reduce_state_changes_to_event(&broken).is_err());
    assert_eq!(service.inner().reductions.load(Ordering::SeqCst), 2);
}
