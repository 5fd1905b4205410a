//! Domain types for the coverage orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Snapshots of jobs, ingestions and finalisation
//! - State changes: Append-only diffs between successive snapshots

pub mod events;
pub mod state_change;

// Re-export commonly used types
pub use events::{
    CommitIdentity, EventKey, FinalisedEvent, IngestionEvent, JobEvent, OrchestratedEvent,
    OrchestratedEventState, OrchestratedEventType, StateChangeFields,
};
pub use state_change::{EventStateChange, EventStateChangeCollection};
