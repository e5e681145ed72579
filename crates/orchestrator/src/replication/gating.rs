//! Which replication tasks may run in which config status.

use std::collections::HashMap;

use conductor_core::{Error, Result, TaskType};
use tracing::warn;

use super::config::{ReplicationConfig, ReplicationStatus};

/// Immutable status → allowed task types table.
///
/// Built once and shared by reference. A status with no entry allows every
/// task; the lookup logs a warning when that happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedTasks {
    table: HashMap<ReplicationStatus, Vec<TaskType>>,
}

impl AllowedTasks {
    /// The production table.
    #[must_use]
    pub fn standard() -> Self {
        use ReplicationStatus as S;
        use TaskType as T;
        Self::from_entries([
            (S::Initialized, vec![T::SetupReplication, T::DeleteReplication, T::RestartReplication]),
            (S::Running, vec![T::EditReplication, T::DeleteReplication, T::RestartReplication]),
            (S::Updating, vec![T::DeleteReplication, T::RestartReplication]),
            (S::Failed, vec![T::DeleteReplication, T::RestartReplication]),
            (S::DeletionFailed, vec![T::DeleteReplication]),
            (S::DeletedUniverse, vec![T::DeleteReplication]),
        ])
    }

    /// Build a table from explicit entries. Statuses left out fail open.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (ReplicationStatus, Vec<TaskType>)>,
    ) -> Self {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    /// Allowed task types for a status, or `None` if the status is unmapped.
    #[must_use]
    pub fn allowed_for(&self, status: ReplicationStatus) -> Option<&[TaskType]> {
        let allowed = self.table.get(&status).map(Vec::as_slice);
        if allowed.is_none() {
            warn!(%status, "No allowed-task entry for replication status, allowing all tasks");
        }
        allowed
    }

    /// Check whether `task_type` may run against `config`.
    #[must_use]
    pub fn is_task_allowed(&self, config: &ReplicationConfig, task_type: TaskType) -> bool {
        self.allowed_for(config.status)
            .is_none_or(|allowed| allowed.contains(&task_type))
    }

    /// [`is_task_allowed`](Self::is_task_allowed) as an admission error.
    pub fn check(&self, config: &ReplicationConfig, task_type: TaskType) -> Result<()> {
        if self.is_task_allowed(config, task_type) {
            return Ok(());
        }
        Err(Error::task_not_allowed(
            task_type.as_str(),
            format!("replication config {}", config.uuid),
            config.status.as_str(),
        ))
    }
}

impl Default for AllowedTasks {
    fn default() -> Self {
        Self::standard()
    }
}

/// Configs in these statuses can only be deleted, and deletion must not
/// try to move them through `Updating` first.
#[must_use]
pub fn must_delete(config: &ReplicationConfig) -> bool {
    matches!(
        config.status,
        ReplicationStatus::DeletionFailed | ReplicationStatus::DeletedUniverse
    )
}
