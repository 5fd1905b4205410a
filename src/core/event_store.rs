//! Append-only state-change stores.
//!
//! The store is the only shared mutable resource. Appends are conditional:
//! a change is rejected with [`EventStoreError::OutOfOrderEvent`] when its
//! version has already been taken for the event key.
//!
//! `JsonlEventStore` keeps one newline-delimited JSON file per event key,
//! grouped in a directory per commit.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{CommitIdentity, EventKey, EventStateChange, EventStateChangeCollection};

use super::error::EventStoreError;

/// Persistence for state-change logs
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a change, rejecting it if its version is already recorded
    async fn append_state_change(&self, key: &EventKey, change: &EventStateChange) -> Result<()>;

    /// All changes for one event key, in write order
    async fn list_state_changes(&self, key: &EventKey) -> Result<Arc<EventStateChangeCollection>>;

    /// One collection per event key recorded for the commit
    async fn list_commit_state_changes(
        &self,
        commit: &CommitIdentity,
    ) -> Result<Vec<Arc<EventStateChangeCollection>>>;
}

fn out_of_order(key: &EventKey, version: u64) -> anyhow::Error {
    anyhow::Error::new(EventStoreError::OutOfOrderEvent {
        event_key: key.to_string(),
        version,
    })
}

/// File-based event store using JSONL format
pub struct JsonlEventStore {
    /// Directory containing one subdirectory per commit
    root: PathBuf,
}

impl JsonlEventStore {
    /// Create or open a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        fs::create_dir_all(&root).await.with_context(|| {
            format!("Failed to create event store directory: {}", root.display())
        })?;

        Ok(Self { root })
    }

    /// Open the store under the configured home directory
    pub async fn open_default() -> Result<Self> {
        Self::open(crate::config::events_dir()?).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every log of a commit
    pub fn commit_dir(&self, commit: &CommitIdentity) -> PathBuf {
        self.root.join(hash_key(&commit.key()))
    }

    /// Path to the log of one event key
    pub fn events_path(&self, key: &EventKey) -> PathBuf {
        self.commit_dir(&key.commit)
            .join(format!("{}.jsonl", hash_key(&key.to_string())))
    }

    async fn read_collection(path: &Path) -> Result<EventStateChangeCollection> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(EventStateChangeCollection::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read events file: {}", path.display()))?;

        parse_changes(content.lines()).map(EventStateChangeCollection::new)
    }
}

fn parse_changes<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<EventStateChange>> {
    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("Failed to parse state change: {}", line))
        })
        .collect()
}

/// Lock the log, check the version is free, then append. Blocking.
fn append_locked(path: &Path, key: &EventKey, change: &EventStateChange) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("Failed to lock events file: {}", path.display()))?;

    let lines: Vec<String> = BufReader::new(&file)
        .lines()
        .collect::<std::io::Result<_>>()
        .context("Failed to read events file")?;
    let latest = parse_changes(lines.iter().map(String::as_str))?
        .iter()
        .map(|c| c.version)
        .max()
        .unwrap_or(0);

    if change.version <= latest {
        return Err(out_of_order(key, change.version));
    }

    let json = serde_json::to_string(change).context("Failed to serialize state change")?;
    file.write_all(format!("{}\n", json).as_bytes())
        .context("Failed to write state change")?;
    file.flush().context("Failed to flush state change")?;

    // Dropping the handle releases the lock
    Ok(())
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append_state_change(&self, key: &EventKey, change: &EventStateChange) -> Result<()> {
        let path = self.events_path(key);
        let key = key.clone();
        let change = change.clone();

        debug!(event_key = %key, version = change.version, "Appending state change");

        tokio::task::spawn_blocking(move || append_locked(&path, &key, &change))
            .await
            .context("State change append task panicked")?
    }

    async fn list_state_changes(&self, key: &EventKey) -> Result<Arc<EventStateChangeCollection>> {
        Self::read_collection(&self.events_path(key))
            .await
            .map(Arc::new)
    }

    async fn list_commit_state_changes(
        &self,
        commit: &CommitIdentity,
    ) -> Result<Vec<Arc<EventStateChangeCollection>>> {
        let commit_dir = self.commit_dir(commit);
        if !fs::try_exists(&commit_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut collections = Vec::new();
        let mut entries = fs::read_dir(&commit_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }

            let collection = Self::read_collection(&path).await?;
            if !collection.is_empty() {
                collections.push(collection);
            }
        }

        // Directory order is arbitrary
        collections.sort_by(|a, b| a.event_key().cmp(&b.event_key()));

        Ok(collections.into_iter().map(Arc::new).collect())
    }
}

/// In-process store for tests and dry runs
#[derive(Default)]
pub struct InMemoryEventStore {
    logs: Mutex<HashMap<EventKey, Vec<EventStateChange>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_state_change(&self, key: &EventKey, change: &EventStateChange) -> Result<()> {
        let mut logs = self.logs.lock().await;
        let log = logs.entry(key.clone()).or_default();

        let latest = log.iter().map(|c| c.version).max().unwrap_or(0);
        if change.version <= latest {
            return Err(out_of_order(key, change.version));
        }

        log.push(change.clone());
        Ok(())
    }

    async fn list_state_changes(&self, key: &EventKey) -> Result<Arc<EventStateChangeCollection>> {
        let logs = self.logs.lock().await;
        let changes = logs.get(key).cloned().unwrap_or_default();
        Ok(Arc::new(EventStateChangeCollection::new(changes)))
    }

    async fn list_commit_state_changes(
        &self,
        commit: &CommitIdentity,
    ) -> Result<Vec<Arc<EventStateChangeCollection>>> {
        let logs = self.logs.lock().await;

        let mut matching: Vec<(String, &Vec<EventStateChange>)> = logs
            .iter()
            .filter(|(key, log)| key.commit == *commit && !log.is_empty())
            .map(|(key, log)| (key.to_string(), log))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(matching
            .into_iter()
            .map(|(_, log)| Arc::new(EventStateChangeCollection::new(log.clone())))
            .collect())
    }
}

/// Hash a key into a file-system safe name (first 16 chars of SHA256)
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
