//! Diffing snapshots into state changes and reducing them back.
//!
//! Both operations are pure: the service holds no state and never touches
//! the store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::events::TYPE_FIELD;
use crate::domain::{
    EventStateChange, EventStateChangeCollection, OrchestratedEvent, OrchestratedEventType,
    StateChangeFields,
};

use super::error::EventStoreError;

/// Computes and reduces state changes for orchestrated events
pub trait EventStateService: Send + Sync {
    /// Fields of `new_state` that are new or differ from `current_state`
    fn get_state_change_for_event(
        &self,
        current_state: Option<&OrchestratedEvent>,
        new_state: &OrchestratedEvent,
    ) -> Result<StateChangeFields, EventStoreError>;

    /// Fold a collection into its current snapshot (`None` when empty)
    fn reduce_state_changes_to_event(
        &self,
        collection: &Arc<EventStateChangeCollection>,
    ) -> Result<Option<OrchestratedEvent>, EventStoreError>;
}

/// Stateless diff/reduce implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct EventStoreService;

impl EventStoreService {
    pub fn new() -> Self {
        Self
    }

    /// Diff two snapshots of the same variant.
    ///
    /// Without a current state the full normalized field set is returned.
    /// Fields missing from `new_state` are not reported as deletions.
    pub fn get_state_change(
        &self,
        current_state: Option<&OrchestratedEvent>,
        new_state: &OrchestratedEvent,
    ) -> Result<StateChangeFields, EventStoreError> {
        let new_fields = new_state.to_fields()?;

        let Some(current_state) = current_state else {
            return Ok(new_fields);
        };

        if current_state.event_type() != new_state.event_type() {
            return Err(EventStoreError::InvalidState {
                current: current_state.event_type(),
                new: new_state.event_type(),
            });
        }

        let current_fields = current_state.to_fields()?;

        Ok(new_fields
            .into_iter()
            .filter(|(key, value)| current_fields.get(key) != Some(value))
            .collect())
    }

    /// Overlay changes in order, skipping any whose type differs from the first.
    ///
    /// Returns the reducing type and the merged fields, or `None` for an
    /// empty input.
    pub fn merge_state_changes<'a, I>(
        &self,
        changes: I,
    ) -> Option<(OrchestratedEventType, StateChangeFields)>
    where
        I: IntoIterator<Item = &'a EventStateChange>,
    {
        let mut reducing_type: Option<OrchestratedEventType> = None;
        let mut merged = StateChangeFields::new();

        for change in changes {
            let event_type = *reducing_type.get_or_insert(change.event_type);

            if change.event_type != event_type {
                warn!(
                    event_key = %change.event_key,
                    version = change.version,
                    expected = %event_type,
                    found = %change.event_type,
                    "Skipping state change of a foreign type"
                );
                continue;
            }

            for (key, value) in &change.changes {
                merged.insert(key.clone(), value.clone());
            }
        }

        reducing_type.map(|event_type| (event_type, merged))
    }

    /// Reduce ordered changes into a snapshot
    pub fn reduce_state_changes<'a, I>(
        &self,
        changes: I,
    ) -> Result<Option<OrchestratedEvent>, EventStoreError>
    where
        I: IntoIterator<Item = &'a EventStateChange>,
    {
        let Some((event_type, mut fields)) = self.merge_state_changes(changes) else {
            return Ok(None);
        };

        fields.remove(TYPE_FIELD);
        debug!(%event_type, fields = fields.len(), "Reduced state changes");

        OrchestratedEvent::from_fields(event_type, fields).map(Some)
    }
}

impl EventStateService for EventStoreService {
    fn get_state_change_for_event(
        &self,
        current_state: Option<&OrchestratedEvent>,
        new_state: &OrchestratedEvent,
    ) -> Result<StateChangeFields, EventStoreError> {
        self.get_state_change(current_state, new_state)
    }

    fn reduce_state_changes_to_event(
        &self,
        collection: &Arc<EventStateChangeCollection>,
    ) -> Result<Option<OrchestratedEvent>, EventStoreError> {
        self.reduce_state_changes(collection.iter())
    }
}
