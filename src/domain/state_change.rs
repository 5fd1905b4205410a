//! State-change records: the append-only log entries for an orchestrated event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{OrchestratedEventType, StateChangeFields};

/// The fields that changed between two snapshots of the same event.
///
/// Records are immutable once appended. `version` is the 1-based position
/// in the event's log, which the store uses to reject concurrent writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStateChange {
    /// Key of the event this change belongs to
    pub event_key: String,

    /// Position in the log (first change is version 1)
    pub version: u64,

    /// Variant of the event that produced this change
    #[serde(rename = "type")]
    pub event_type: OrchestratedEventType,

    /// Changed or new fields only
    pub changes: StateChangeFields,

    /// When the change was recorded
    pub recorded_at: DateTime<Utc>,
}

impl EventStateChange {
    pub fn new(
        event_key: impl Into<String>,
        version: u64,
        event_type: OrchestratedEventType,
        changes: StateChangeFields,
    ) -> Self {
        Self {
            event_key: event_key.into(),
            version,
            event_type,
            changes,
            recorded_at: Utc::now(),
        }
    }
}

/// Ordered state changes for one event key, in the order the store wrote them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventStateChangeCollection {
    changes: Vec<EventStateChange>,
}

impl EventStateChangeCollection {
    pub fn new(changes: Vec<EventStateChange>) -> Self {
        Self { changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventStateChange> {
        self.changes.iter()
    }

    /// Event key of the collection, taken from its first change
    pub fn event_key(&self) -> Option<&str> {
        self.changes.first().map(|c| c.event_key.as_str())
    }

    /// Highest version recorded so far (0 when empty)
    pub fn latest_version(&self) -> u64 {
        self.changes.iter().map(|c| c.version).max().unwrap_or(0)
    }

    /// Version the next appended change must carry
    pub fn next_version(&self) -> u64 {
        self.latest_version() + 1
    }
}

impl From<Vec<EventStateChange>> for EventStateChangeCollection {
    fn from(changes: Vec<EventStateChange>) -> Self {
        Self::new(changes)
    }
}

impl<'a> IntoIterator for &'a EventStateChangeCollection {
    type Item = &'a EventStateChange;
    type IntoIter = std::slice::Iter<'a, EventStateChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
