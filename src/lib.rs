//! covorch - Event-sourced coverage orchestrator
//!
//! Tracks the jobs and coverage ingestions of a commit and decides when
//! the commit's coverage is ready to finalise.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Each lifecycle message is a snapshot of one orchestrated event
//! - Only the diff against the recorded state is appended to the log
//! - Current state is derived by reducing the log in write order
//! - Concurrent writers are serialized by conditional appends and backoff
//!
//! # Modules
//!
//! - `core`: Orchestration logic (EventStore, EventStoreService, Backoff)
//! - `domain`: Data structures (OrchestratedEvent, EventStateChange)
//! - `config`: Resolved configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Record a lifecycle snapshot
//! covorch record --input job.json
//!
//! # Check whether a commit is ready to finalise
//! covorch ready --provider github --owner o --repository r --ref main --commit abc123
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    CachingEventStoreService, EventStore, EventStoreError, EventStoreService, Orchestrator,
    TraceContext,
};
pub use crate::domain::{EventStateChange, EventStateChangeCollection, OrchestratedEvent};
