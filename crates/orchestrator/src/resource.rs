//! Versioned universe records.
//!
//! A universe is the only shared mutable object guarded by the lock. Its
//! `version` advances exactly once per successful lock acquisition, and the
//! `(version, update_in_progress)` pair is only ever changed through the
//! store's compare-and-swap.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{Error, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Version precondition for acquiring a universe lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Mutual exclusion only; the caller does not know the current version.
    Any,
    /// The stored version must match exactly.
    Exactly(u64),
}

impl ExpectedVersion {
    /// Check a stored version against this precondition.
    #[must_use]
    pub const fn matches(&self, actual: u64) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(expected) => *expected == actual,
        }
    }
}

impl From<Option<u64>> for ExpectedVersion {
    fn from(version: Option<u64>) -> Self {
        version.map_or(Self::Any, Self::Exactly)
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Planned, not yet provisioned.
    ToBeAdded,
    /// Instance exists, processes not started.
    Provisioned,
    /// Serving.
    Live,
    /// Marked for removal by an edit in progress.
    ToBeRemoved,
    /// Processes stopped.
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToBeAdded => write!(f, "to_be_added"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::Live => write!(f, "live"),
            Self::ToBeRemoved => write!(f, "to_be_removed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One node of a universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetails {
    /// Node name, unique within the universe.
    pub name: String,
    /// Placement zone.
    pub zone: String,
    /// Whether the node runs a master process.
    pub is_master: bool,
    /// Whether the node runs a tablet server process.
    pub is_tserver: bool,
    /// Lifecycle state.
    pub state: NodeState,
}

impl NodeDetails {
    /// A live tablet-server node.
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
            is_master: false,
            is_tserver: true,
            state: NodeState::Live,
        }
    }

    /// Mark the node as a master.
    #[must_use]
    pub const fn master(mut self) -> Self {
        self.is_master = true;
        self
    }

    /// Set the lifecycle state.
    #[must_use]
    pub const fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }
}

/// A universe (cluster) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Universe {
    /// Stable identity.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Optimistic-concurrency version.
    pub version: u64,
    /// True while a task holds the lock.
    pub update_in_progress: bool,
    /// Set by the last step of a successful mutation.
    pub update_succeeded: bool,
    /// Error message recorded by the last failed release.
    pub last_error: Option<String>,
    /// Paused universes take no scheduled backups.
    pub paused: bool,
    /// Whether backups may be taken at all.
    pub backups_enabled: bool,
    /// Nodes in placement order.
    pub nodes: Vec<NodeDetails>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Universe {
    /// Create an unlocked universe at version 1.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeDetails>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            update_in_progress: false,
            update_succeeded: true,
            last_error: None,
            paused: false,
            backups_enabled: true,
            nodes,
            updated_at: Utc::now(),
        }
    }

    /// Look up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeDetails> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Names of the master nodes.
    #[must_use]
    pub fn masters(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.is_master)
            .map(|n| n.name.as_str())
            .collect()
    }
}

/// A mutation applied to a locked universe.
pub type UniverseUpdate = Box<dyn FnOnce(&mut Universe) + Send>;

/// Durable universe storage with an atomic compare-and-swap on
/// `(uuid, version, update_in_progress)`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Insert or replace a universe record.
    async fn put(&self, universe: Universe) -> Result<()>;

    /// Load a universe.
    async fn get(&self, uuid: Uuid) -> Result<Option<Universe>>;

    /// All universes, sorted by UUID.
    async fn list(&self) -> Result<Vec<Universe>>;

    /// Delete a universe record.
    async fn remove(&self, uuid: Uuid) -> Result<Option<Universe>>;

    /// Atomically take the lock.
    ///
    /// Checks the version before the busy flag: a stale caller gets
    /// `StaleVersion` even when the universe is also locked. On success the
    /// version advances by one, `update_in_progress` becomes true, and the
    /// returned value is the record as of lock time.
    async fn try_lock(&self, uuid: Uuid, expected: ExpectedVersion) -> Result<Universe>;

    /// Clear the busy flag, recording `error`. Returns `false` if the
    /// universe was not locked. The version is left unchanged.
    async fn unlock(&self, uuid: Uuid, error: Option<String>) -> Result<bool>;

    /// Apply a mutation to a universe that is currently locked.
    async fn update_locked(&self, uuid: Uuid, update: UniverseUpdate) -> Result<Universe>;
}

/// In-memory universe store.
#[derive(Default)]
pub struct InMemoryResourceStore {
    universes: RwLock<HashMap<Uuid, Universe>>,
}

impl InMemoryResourceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(uuid: Uuid) -> Error {
    Error::not_found("universe", uuid.to_string())
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn put(&self, universe: Universe) -> Result<()> {
        self.universes.write().await.insert(universe.uuid, universe);
        Ok(())
    }

    async fn get(&self, uuid: Uuid) -> Result<Option<Universe>> {
        Ok(self.universes.read().await.get(&uuid).cloned())
    }

    async fn list(&self) -> Result<Vec<Universe>> {
        Ok(self
            .universes
            .read()
            .await
            .values()
            .sorted_by_key(|u| u.uuid)
            .cloned()
            .collect())
    }

    async fn remove(&self, uuid: Uuid) -> Result<Option<Universe>> {
        Ok(self.universes.write().await.remove(&uuid))
    }

    async fn try_lock(&self, uuid: Uuid, expected: ExpectedVersion) -> Result<Universe> {
        let mut universes = self.universes.write().await;
        let universe = universes.get_mut(&uuid).ok_or_else(|| missing(uuid))?;

        if let ExpectedVersion::Exactly(version) = expected {
            if version != universe.version {
                return Err(Error::stale_version(uuid, version, universe.version));
            }
        }
        if universe.update_in_progress {
            return Err(Error::already_locked(uuid));
        }

        universe.version += 1;
        universe.update_in_progress = true;
        universe.update_succeeded = false;
        universe.updated_at = Utc::now();
        Ok(universe.clone())
    }

    async fn unlock(&self, uuid: Uuid, error: Option<String>) -> Result<bool> {
        let mut universes = self.universes.write().await;
        let universe = universes.get_mut(&uuid).ok_or_else(|| missing(uuid))?;
        if !universe.update_in_progress {
            return Ok(false);
        }
        universe.update_in_progress = false;
        universe.last_error = error;
        universe.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_locked(&self, uuid: Uuid, update: UniverseUpdate) -> Result<Universe> {
        let mut universes = self.universes.write().await;
        let universe = universes.get_mut(&uuid).ok_or_else(|| missing(uuid))?;
        if !universe.update_in_progress {
            return Err(Error::invariant_violation(format!(
                "universe {uuid} modified without holding its lock"
            )));
        }
        update(universe);
        universe.updated_at = Utc::now();
        Ok(universe.clone())
    }
}
