//! Replication config records and their store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{Error, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle of a standing replication relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicationStatus {
    /// Created, streams not set up yet.
    Initialized,
    /// Streams are replicating.
    Running,
    /// An edit or restart is in flight.
    Updating,
    /// The last operation failed.
    Failed,
    /// A delete failed; only another delete may run.
    DeletionFailed,
    /// One side's universe is gone; only a delete may run.
    DeletedUniverse,
}

impl ReplicationStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Initialized,
        Self::Running,
        Self::Updating,
        Self::Failed,
        Self::DeletionFailed,
        Self::DeletedUniverse,
    ];

    /// Status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Running => "Running",
            Self::Updating => "Updating",
            Self::Failed => "Failed",
            Self::DeletionFailed => "DeletionFailed",
            Self::DeletedUniverse => "DeletedUniverse",
        }
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReplicationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::not_found("replication status", s))
    }
}

/// Per-table replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    /// Accepted for replication.
    Validated,
    /// Copying the initial data set.
    Bootstrapping,
    /// Being added or reconfigured.
    Updating,
    /// Replicating.
    Running,
    /// Setup or update of this table failed.
    Failed,
}

impl TableStatus {
    /// Statuses that only make sense while a task is working on the table.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Validated | Self::Bootstrapping | Self::Updating)
    }
}

/// A replication relationship from a source to a target universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Config ID.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Universe data is read from.
    pub source: Uuid,
    /// Universe data is written to.
    pub target: Uuid,
    /// Relationship status.
    pub status: ReplicationStatus,
    /// Whether the streams are paused.
    pub paused: bool,
    /// Replicated tables with their status.
    pub tables: BTreeMap<String, TableStatus>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ReplicationConfig {
    /// Create an `Initialized` config with every table `Validated`.
    pub fn new(
        name: impl Into<String>,
        source: Uuid,
        target: Uuid,
        tables: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            source,
            target,
            status: ReplicationStatus::Initialized,
            paused: false,
            tables: tables
                .into_iter()
                .map(|t| (t, TableStatus::Validated))
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Both universes, source first.
    #[must_use]
    pub const fn universes(&self) -> [Uuid; 2] {
        [self.source, self.target]
    }

    /// Check whether a universe is either side of this config.
    #[must_use]
    pub fn touches(&self, universe: Uuid) -> bool {
        self.source == universe || self.target == universe
    }

    /// Table names, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Set every table's status.
    pub fn set_all_tables(&mut self, status: TableStatus) {
        for table in self.tables.values_mut() {
            *table = status;
        }
    }
}

/// A mutation applied to a stored config.
pub type ConfigUpdate = Box<dyn FnOnce(&mut ReplicationConfig) + Send>;

/// Durable replication config storage.
#[async_trait]
pub trait ReplicationStore: Send + Sync {
    /// Insert or replace a config.
    async fn put(&self, config: ReplicationConfig) -> Result<()>;

    /// Load a config.
    async fn get(&self, uuid: Uuid) -> Result<Option<ReplicationConfig>>;

    /// All configs, sorted by UUID.
    async fn list(&self) -> Result<Vec<ReplicationConfig>>;

    /// Delete a config.
    async fn remove(&self, uuid: Uuid) -> Result<Option<ReplicationConfig>>;

    /// Apply a mutation and return the stored result.
    async fn update(&self, uuid: Uuid, update: ConfigUpdate) -> Result<ReplicationConfig>;

    /// Set the relationship status.
    async fn set_status(&self, uuid: Uuid, status: ReplicationStatus) -> Result<ReplicationConfig> {
        self.update(uuid, Box::new(move |c| c.status = status)).await
    }

    /// Force every table still in a pending status to `Failed`.
    async fn fail_pending_tables(&self, uuid: Uuid) -> Result<ReplicationConfig> {
        self.update(
            uuid,
            Box::new(|c| {
                for status in c.tables.values_mut() {
                    if status.is_pending() {
                        *status = TableStatus::Failed;
                    }
                }
            }),
        )
        .await
    }

    /// Configs with `universe` on either side.
    async fn configs_touching(&self, universe: Uuid) -> Result<Vec<ReplicationConfig>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.touches(universe))
            .collect())
    }
}

/// In-memory replication config store.
#[derive(Default)]
pub struct InMemoryReplicationStore {
    configs: RwLock<HashMap<Uuid, ReplicationConfig>>,
}

impl InMemoryReplicationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicationStore for InMemoryReplicationStore {
    async fn put(&self, config: ReplicationConfig) -> Result<()> {
        self.configs.write().await.insert(config.uuid, config);
        Ok(())
    }

    async fn get(&self, uuid: Uuid) -> Result<Option<ReplicationConfig>> {
        Ok(self.configs.read().await.get(&uuid).cloned())
    }

    async fn list(&self) -> Result<Vec<ReplicationConfig>> {
        Ok(self
            .configs
            .read()
            .await
            .values()
            .sorted_by_key(|c| c.uuid)
            .cloned()
            .collect())
    }

    async fn remove(&self, uuid: Uuid) -> Result<Option<ReplicationConfig>> {
        Ok(self.configs.write().await.remove(&uuid))
    }

    async fn update(&self, uuid: Uuid, update: ConfigUpdate) -> Result<ReplicationConfig> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(&uuid)
            .ok_or_else(|| Error::not_found("replication config", uuid.to_string()))?;
        update(config);
        config.updated_at = Utc::now();
        Ok(config.clone())
    }
}
