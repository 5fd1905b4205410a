//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only state-change logs with conditional appends
//! - EventStoreService: Diffing snapshots and reducing state changes
//! - CachingEventStoreService: Per-invocation reduction cache
//! - Backoff: Retry strategies for recording and finalisation polling
//! - Orchestrator: Main lifecycle-event engine

pub mod backoff;
pub mod caching;
pub mod error;
pub mod event_store;
pub mod orchestrator;
pub mod state_service;

// Re-export commonly used types
pub use backoff::{
    run_with_backoff, BackoffStrategy, DelaySchedule, EventStoreRecorderBackoffStrategy,
    Readiness, ReadyToFinaliseBackoffStrategy,
};
pub use caching::CachingEventStoreService;
pub use error::EventStoreError;
pub use event_store::{hash_key, EventStore, InMemoryEventStore, JsonlEventStore};
pub use orchestrator::{
    FinalisationDecision, FinalisationState, FinalisedEventPublisher, HandleOutcome,
    LoggingPublisher, Orchestrator, RecordOutcome, TraceContext,
};
pub use state_service::{EventStateService, EventStoreService};
