//! Main orchestrator for lifecycle events.
//!
//! Coordinates diffing against the recorded state, conditional appends
//! under the recorder backoff, and the ready-to-finalise decision for a
//! commit.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    CommitIdentity, EventStateChange, EventStateChangeCollection, FinalisedEvent,
    OrchestratedEvent, OrchestratedEventState, OrchestratedEventType,
};

use super::backoff::{
    EventStoreRecorderBackoffStrategy, Readiness, ReadyToFinaliseBackoffStrategy,
};
use super::caching::CachingEventStoreService;
use super::error::EventStoreError;
use super::event_store::EventStore;
use super::state_service::EventStateService;

/// Correlation identifier threaded through one event-processing invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// Start a fresh trace
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Result of recording one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Nothing differed from the recorded state
    Unchanged,

    /// The snapshot is older than the recorded state and was ignored
    Stale,

    /// A state change was appended
    Recorded { version: u64 },
}

/// Aggregate lifecycle of a commit's coverage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalisationState {
    /// No job or ingestion recorded yet
    Pending,

    /// At least one job or ingestion is still running
    Ongoing,

    /// Everything finished and nothing failed
    Success,

    /// Everything finished and something failed
    Failure,
}

impl FinalisationState {
    /// Aggregate the states of every constituent event
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = OrchestratedEventState>,
    {
        let mut aggregate = Self::Pending;

        for state in states {
            aggregate = match (aggregate, state) {
                (_, OrchestratedEventState::Ongoing) | (Self::Ongoing, _) => Self::Ongoing,
                (Self::Failure, _) | (_, OrchestratedEventState::Failure) => Self::Failure,
                _ => Self::Success,
            };
        }

        aggregate
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// State a finalised event carries, if this is terminal
    pub fn as_event_state(&self) -> Option<OrchestratedEventState> {
        match self {
            Self::Success => Some(OrchestratedEventState::Success),
            Self::Failure => Some(OrchestratedEventState::Failure),
            Self::Pending | Self::Ongoing => None,
        }
    }
}

/// What happened to the commit's finalisation while handling an event
#[derive(Debug, Clone, PartialEq)]
pub enum FinalisationDecision {
    /// The event cannot trigger finalisation (not terminal, or a finalised event)
    NotApplicable,

    /// Polling ran out while work was still outstanding
    NotReady(FinalisationState),

    /// The commit was already finalised
    AlreadyFinalised,

    /// A finalised event was recorded and should be published
    Finalised(OrchestratedEvent),
}

/// Outcome of handling one lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub struct HandleOutcome {
    pub record: RecordOutcome,
    pub finalisation: FinalisationDecision,
}

/// Publishes finalised events to downstream consumers
#[async_trait]
pub trait FinalisedEventPublisher: Send + Sync {
    async fn publish(&self, event: &OrchestratedEvent, trace: &TraceContext) -> Result<()>;
}

/// Publisher that only emits a structured log record
#[derive(Debug, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl FinalisedEventPublisher for LoggingPublisher {
    async fn publish(&self, event: &OrchestratedEvent, trace: &TraceContext) -> Result<()> {
        info!(
            trace_id = %trace.trace_id,
            commit = %event.identity(),
            state = ?event.state(),
            "Coverage finalised"
        );
        Ok(())
    }
}

/// Main lifecycle-event orchestrator.
///
/// Build one per invocation: the default state service caches reductions
/// for as long as the orchestrator lives.
pub struct Orchestrator<S, R = CachingEventStoreService> {
    store: S,
    state_service: R,
    recorder: EventStoreRecorderBackoffStrategy,
    finaliser: ReadyToFinaliseBackoffStrategy,
}

impl<S: EventStore> Orchestrator<S> {
    /// Create an orchestrator with default strategies and a fresh cache
    pub fn new(store: S) -> Self {
        Self::with_state_service(store, CachingEventStoreService::default())
    }
}

impl<S: EventStore, R: EventStateService> Orchestrator<S, R> {
    pub fn with_state_service(store: S, state_service: R) -> Self {
        Self {
            store,
            state_service,
            recorder: EventStoreRecorderBackoffStrategy::default(),
            finaliser: ReadyToFinaliseBackoffStrategy::default(),
        }
    }

    /// Replace both backoff strategies
    pub fn with_backoff(
        mut self,
        recorder: EventStoreRecorderBackoffStrategy,
        finaliser: ReadyToFinaliseBackoffStrategy,
    ) -> Self {
        self.recorder = recorder;
        self.finaliser = finaliser;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state_service(&self) -> &R {
        &self.state_service
    }

    /// Diff `event` against its recorded state and append the change
    #[instrument(
        skip(self, event, trace),
        fields(trace_id = %trace.trace_id, event_key = %event.event_key())
    )]
    pub async fn record_event(
        &self,
        event: &OrchestratedEvent,
        trace: &TraceContext,
    ) -> Result<RecordOutcome> {
        let collection = self.store.list_state_changes(&event.event_key()).await?;
        self.record_against(event, &collection).await
    }

    /// Diff `event` against an already fetched log of its key and append
    async fn record_against(
        &self,
        event: &OrchestratedEvent,
        collection: &Arc<EventStateChangeCollection>,
    ) -> Result<RecordOutcome> {
        let key = event.event_key();
        let current = self.state_service.reduce_state_changes_to_event(collection)?;

        if let Some(ref current) = current {
            if current.updated_at() > event.updated_at() {
                warn!(
                    recorded = %current.updated_at(),
                    received = %event.updated_at(),
                    "Ignoring snapshot older than recorded state"
                );
                return Ok(RecordOutcome::Stale);
            }
        }

        let changes = self
            .state_service
            .get_state_change_for_event(current.as_ref(), event)?;

        if changes.is_empty() {
            debug!("Snapshot matches recorded state");
            return Ok(RecordOutcome::Unchanged);
        }

        let change = EventStateChange::new(
            key.to_string(),
            collection.next_version(),
            event.event_type(),
            changes,
        );

        let store = &self.store;
        let key_ref = &key;
        let change_ref = &change;
        let recorded = self
            .recorder
            .run(move || async move {
                store
                    .append_state_change(key_ref, change_ref)
                    .await
                    .map(|()| true)
            })
            .await
            .with_context(|| format!("Failed to record state change for {}", key))?;

        if !recorded {
            anyhow::bail!("State change for {} was not recorded", key);
        }

        info!(version = change.version, fields = change.changes.len(), "Recorded state change");
        Ok(RecordOutcome::Recorded {
            version: change.version,
        })
    }

    /// Aggregate state of every job and ingestion recorded for `commit`
    pub async fn finalisation_state(&self, commit: &CommitIdentity) -> Result<FinalisationState> {
        let collections = self.store.list_commit_state_changes(commit).await?;
        let mut states = Vec::with_capacity(collections.len());

        for collection in &collections {
            let Some(event) = self.state_service.reduce_state_changes_to_event(collection)? else {
                continue;
            };

            if event.event_type() != OrchestratedEventType::Finalised {
                states.push(event.state());
            }
        }

        Ok(FinalisationState::aggregate(states))
    }

    /// Poll until every constituent event is terminal or attempts run out
    #[instrument(skip(self, commit, trace), fields(trace_id = %trace.trace_id, commit = %commit))]
    pub async fn ready_to_finalise(
        &self,
        commit: &CommitIdentity,
        trace: &TraceContext,
    ) -> Result<(Readiness, FinalisationState)> {
        let last_state = Mutex::new(FinalisationState::Pending);
        let last_state_ref = &last_state;

        let readiness = self
            .finaliser
            .run(move || async move {
                let state = self.finalisation_state(commit).await?;
                *last_state_ref
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;

                debug!(?state, "Checked finalisation state");
                Ok::<_, anyhow::Error>(if state.is_terminal() {
                    Readiness::Ready
                } else {
                    Readiness::NotReady
                })
            })
            .await?;

        let state = last_state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok((readiness, state))
    }

    /// Record a lifecycle event and finalise its commit when everything is done
    #[instrument(
        skip(self, event, trace),
        fields(trace_id = %trace.trace_id, event_type = %event.event_type())
    )]
    pub async fn handle(
        &self,
        event: &OrchestratedEvent,
        trace: &TraceContext,
    ) -> Result<HandleOutcome> {
        let record = self.record_event(event, trace).await?;

        if event.event_type() == OrchestratedEventType::Finalised || !event.state().is_terminal() {
            return Ok(HandleOutcome {
                record,
                finalisation: FinalisationDecision::NotApplicable,
            });
        }

        let commit = event.identity();
        let (readiness, state) = self.ready_to_finalise(commit, trace).await?;

        let finalisation = match (readiness, state.as_event_state()) {
            (Readiness::Ready, Some(final_state)) => {
                self.finalise(commit, final_state, trace).await?
            }
            _ => {
                info!(?state, "Commit not ready to finalise");
                FinalisationDecision::NotReady(state)
            }
        };

        Ok(HandleOutcome {
            record,
            finalisation,
        })
    }

    async fn finalise(
        &self,
        commit: &CommitIdentity,
        state: OrchestratedEventState,
        trace: &TraceContext,
    ) -> Result<FinalisationDecision> {
        let now = Utc::now();
        let event = OrchestratedEvent::Finalised(FinalisedEvent {
            identity: commit.clone(),
            state,
            created_at: now,
            updated_at: now,
        });

        let key = event.event_key();
        let collection = self.store.list_state_changes(&key).await?;
        if self.is_finalised(&collection)? {
            info!("Commit already finalised");
            return Ok(FinalisationDecision::AlreadyFinalised);
        }

        // The log fetched above is reduced again while diffing, from the cache
        match self.record_against(&event, &collection).await {
            Ok(RecordOutcome::Recorded { .. }) => {
                info!(trace_id = %trace.trace_id, ?state, "Finalised commit");
                Ok(FinalisationDecision::Finalised(event))
            }
            Ok(RecordOutcome::Unchanged | RecordOutcome::Stale) => {
                Ok(FinalisationDecision::AlreadyFinalised)
            }
            Err(e) if EventStoreError::is_out_of_order_error(&e) => {
                // Another invocation finalised between our check and append
                let latest = self.store.list_state_changes(&key).await?;
                if self.is_finalised(&latest)? {
                    info!("Commit finalised concurrently");
                    return Ok(FinalisationDecision::AlreadyFinalised);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn is_finalised(&self, collection: &Arc<EventStateChangeCollection>) -> Result<bool> {
        Ok(self
            .state_service
            .reduce_state_changes_to_event(collection)?
            .is_some_and(|existing| existing.state().is_terminal()))
    }
}
