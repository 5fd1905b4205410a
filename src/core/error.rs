//! Errors raised while diffing, reducing and recording state changes.

use thiserror::Error;

use crate::domain::OrchestratedEventType;

/// Event store errors
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Two snapshots of different variants cannot be diffed
    #[error("Cannot diff a {current} event against a {new} event")]
    InvalidState {
        current: OrchestratedEventType,
        new: OrchestratedEventType,
    },

    /// A change with this version (or a later one) was already recorded
    #[error("Out of order event: version {version} already recorded for {event_key}")]
    OutOfOrderEvent { event_key: String, version: u64 },

    /// Reduced fields do not form a valid event
    #[error("Failed to deserialize {event_type} event from state changes: {source}")]
    Deserialization {
        event_type: OrchestratedEventType,
        #[source]
        source: serde_json::Error,
    },
}

impl EventStoreError {
    /// Check if a conditional append lost a race to a newer change
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, Self::OutOfOrderEvent { .. })
    }

    /// Check if an `anyhow` error wraps an out-of-order rejection
    pub fn is_out_of_order_error(error: &anyhow::Error) -> bool {
        error
            .downcast_ref::<EventStoreError>()
            .map(Self::is_out_of_order)
            .unwrap_or(false)
    }
}
