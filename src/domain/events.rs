//! Orchestrated events tracked by the orchestrator.
//!
//! An orchestrated event is a snapshot of one unit of work for a commit:
//! a CI job run, a coverage ingestion, or the commit's finalisation. Snapshots
//! are never stored directly; only the field-level diff between successive
//! snapshots is appended to the event log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::EventStoreError;

/// Flat key/value view of a snapshot, or the delta between two snapshots.
pub type StateChangeFields = Map<String, Value>;

/// Name of the discriminator field in a normalized snapshot
pub const TYPE_FIELD: &str = "type";

/// The commit a set of orchestrated events belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitIdentity {
    /// Version-control provider (e.g. "github")
    pub provider: String,

    /// Repository owner
    pub owner: String,

    /// Repository name
    pub repository: String,

    /// Branch or pull request ref
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Commit SHA
    pub commit: String,
}

impl CommitIdentity {
    pub fn new(
        provider: impl Into<String>,
        owner: impl Into<String>,
        repository: impl Into<String>,
        git_ref: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            owner: owner.into(),
            repository: repository.into(),
            git_ref: git_ref.into(),
            commit: commit.into(),
        }
    }

    /// Key shared by every event of this commit
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.provider, self.owner, self.repository, self.git_ref, self.commit
        )
    }
}

impl fmt::Display for CommitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Lifecycle state of a single orchestrated event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratedEventState {
    /// Work is still in progress
    #[default]
    Ongoing,

    /// Finished successfully
    Success,

    /// Finished with a failure
    Failure,
}

impl OrchestratedEventState {
    /// Success and failure are terminal for a snapshot
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ongoing)
    }
}

/// Discriminator carried by every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratedEventType {
    Job,
    Ingestion,
    Finalised,
}

impl OrchestratedEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Ingestion => "ingestion",
            Self::Finalised => "finalised",
        }
    }
}

impl fmt::Display for OrchestratedEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one orchestrated event's state-change log.
///
/// Renders as `<provider>:<owner>:<repository>:<ref>:<commit>:<type>:<discriminator>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub commit: CommitIdentity,
    pub event_type: OrchestratedEventType,
    pub discriminator: String,
}

impl EventKey {
    pub fn new(
        commit: CommitIdentity,
        event_type: OrchestratedEventType,
        discriminator: impl Into<String>,
    ) -> Self {
        Self {
            commit,
            event_type,
            discriminator: discriminator.into(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.commit, self.event_type, self.discriminator)
    }
}

impl FromStr for EventKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(7, ':').collect();
        let [provider, owner, repository, git_ref, commit, event_type, discriminator] =
            parts.as_slice()
        else {
            anyhow::bail!("Invalid event key (expected 7 ':'-separated parts): {}", s);
        };

        let event_type = match *event_type {
            "job" => OrchestratedEventType::Job,
            "ingestion" => OrchestratedEventType::Ingestion,
            "finalised" => OrchestratedEventType::Finalised,
            other => anyhow::bail!("Unknown event type in key: {}", other),
        };

        Ok(Self::new(
            CommitIdentity::new(*provider, *owner, *repository, *git_ref, *commit),
            event_type,
            *discriminator,
        ))
    }
}

/// A CI job run reported by the version-control provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(flatten)]
    pub identity: CommitIdentity,

    /// Provider's identifier for the job
    pub external_id: String,

    /// Human-readable job name
    #[serde(default)]
    pub name: Option<String>,

    pub state: OrchestratedEventState,

    /// Position of the job within its workflow run
    #[serde(default)]
    pub index: Option<u32>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// An uploaded coverage file moving through ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionEvent {
    #[serde(flatten)]
    pub identity: CommitIdentity,

    /// Identifier of the coverage upload being ingested
    pub upload_id: String,

    pub state: OrchestratedEventState,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Marks that coverage for a commit has been finalised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalisedEvent {
    #[serde(flatten)]
    pub identity: CommitIdentity,

    pub state: OrchestratedEventState,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// A snapshot of one orchestrated event.
///
/// Normalizes to a flat field map tagged with `type`, which is the shape
/// state changes are computed over and reduced back from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratedEvent {
    Job(JobEvent),
    Ingestion(IngestionEvent),
    Finalised(FinalisedEvent),
}

impl OrchestratedEvent {
    pub fn event_type(&self) -> OrchestratedEventType {
        match self {
            Self::Job(_) => OrchestratedEventType::Job,
            Self::Ingestion(_) => OrchestratedEventType::Ingestion,
            Self::Finalised(_) => OrchestratedEventType::Finalised,
        }
    }

    pub fn identity(&self) -> &CommitIdentity {
        match self {
            Self::Job(e) => &e.identity,
            Self::Ingestion(e) => &e.identity,
            Self::Finalised(e) => &e.identity,
        }
    }

    pub fn state(&self) -> OrchestratedEventState {
        match self {
            Self::Job(e) => e.state,
            Self::Ingestion(e) => e.state,
            Self::Finalised(e) => e.state,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Job(e) => e.updated_at,
            Self::Ingestion(e) => e.updated_at,
            Self::Finalised(e) => e.updated_at,
        }
    }

    /// Variant-specific part of the event key
    pub fn discriminator(&self) -> &str {
        match self {
            Self::Job(e) => &e.external_id,
            Self::Ingestion(e) => &e.upload_id,
            Self::Finalised(_) => "finalised",
        }
    }

    /// Key of the state-change log this event belongs to
    pub fn event_key(&self) -> EventKey {
        EventKey::new(
            self.identity().clone(),
            self.event_type(),
            self.discriminator(),
        )
    }

    /// Flatten the snapshot into its normalized field map (includes `type`)
    pub fn to_fields(&self) -> Result<StateChangeFields, EventStoreError> {
        serde_json::to_value(self)
            .and_then(serde_json::from_value::<StateChangeFields>)
            .map_err(|source| EventStoreError::Deserialization {
                event_type: self.event_type(),
                source,
            })
    }

    /// Rebuild a snapshot of `event_type` from a normalized field map
    pub fn from_fields(
        event_type: OrchestratedEventType,
        mut fields: StateChangeFields,
    ) -> Result<Self, EventStoreError> {
        fields.insert(
            TYPE_FIELD.to_string(),
            Value::String(event_type.as_str().to_string()),
        );

        serde_json::from_value(Value::Object(fields))
            .map_err(|source| EventStoreError::Deserialization { event_type, source })
    }
}
