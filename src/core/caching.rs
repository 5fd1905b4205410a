//! Per-invocation memoization of state-change reductions.

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::domain::{EventStateChangeCollection, OrchestratedEvent, StateChangeFields};

use super::error::EventStoreError;
use super::state_service::{EventStateService, EventStoreService};

type CachedReduction = (Weak<EventStateChangeCollection>, Option<OrchestratedEvent>);

/// Caches reductions by collection instance, not by contents.
///
/// Entries hold only a weak reference to their collection; once every
/// `Arc` to it is dropped the entry is pruned on the next lookup. Two
/// collections with equal contents are separate entries.
pub struct CachingEventStoreService<S = EventStoreService> {
    inner: S,
    reductions: Mutex<Vec<CachedReduction>>,
}

impl Default for CachingEventStoreService<EventStoreService> {
    fn default() -> Self {
        Self::new(EventStoreService::new())
    }
}

impl<S: EventStateService> CachingEventStoreService<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reductions: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped service
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of live cache entries
    pub fn cached_len(&self) -> usize {
        let mut reductions = self.lock();
        prune(&mut reductions);
        reductions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CachedReduction>> {
        // A poisoned cache only ever holds completed reductions
        self.reductions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(
        &self,
        collection: &Arc<EventStateChangeCollection>,
    ) -> Option<Option<OrchestratedEvent>> {
        let mut reductions = self.lock();
        prune(&mut reductions);

        reductions
            .iter()
            .find(|(weak, _)| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(collection)))
            .map(|(_, reduction)| reduction.clone())
    }
}

fn prune(reductions: &mut Vec<CachedReduction>) {
    reductions.retain(|(weak, _)| weak.strong_count() > 0);
}

impl<S: EventStateService> EventStateService for CachingEventStoreService<S> {
    fn get_state_change_for_event(
        &self,
        current_state: Option<&OrchestratedEvent>,
        new_state: &OrchestratedEvent,
    ) -> Result<StateChangeFields, EventStoreError> {
        self.inner.get_state_change_for_event(current_state, new_state)
    }

    fn reduce_state_changes_to_event(
        &self,
        collection: &Arc<EventStateChangeCollection>,
    ) -> Result<Option<OrchestratedEvent>, EventStoreError> {
        if let Some(reduction) = self.lookup(collection) {
            debug!(
                event_key = collection.event_key().unwrap_or_default(),
                "Reusing cached reduction"
            );
            return Ok(reduction);
        }

        let reduction = self.inner.reduce_state_changes_to_event(collection)?;

        self.lock()
            .push((Arc::downgrade(collection), reduction.clone()));

        Ok(reduction)
    }
}
