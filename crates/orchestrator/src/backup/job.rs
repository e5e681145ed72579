//! Backup and restore job records.

use chrono::{DateTime, Utc};
use conductor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    /// Owned by a running task.
    InProgress,
    /// Stored and usable.
    Completed,
    /// The task failed.
    Failed,
    /// The task was aborted.
    Stopped,
    /// Abandoned outside of a task.
    Aborted,
}

impl BackupState {
    /// Check if the state is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// One backup, full or incremental.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Backup ID.
    pub uuid: Uuid,
    /// Universe the backup was taken from.
    pub universe: Uuid,
    /// Task that created the backup.
    pub task: Uuid,
    /// Full backup this one increments, if any.
    pub base_backup: Option<Uuid>,
    /// Schedule that triggered the backup, if any.
    pub schedule: Option<Uuid>,
    /// Keyspace being backed up.
    pub keyspace: String,
    /// Storage location.
    pub location: String,
    /// Lifecycle state.
    pub state: BackupState,
    /// Bytes uploaded.
    pub size_bytes: u64,
    /// Completion time of the newest increment on top of this backup.
    pub last_increment_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    /// Create an in-progress backup owned by `task`.
    pub fn new(
        uuid: Uuid,
        universe: Uuid,
        task: Uuid,
        keyspace: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            uuid,
            universe,
            task,
            base_backup: None,
            schedule: None,
            keyspace: keyspace.into(),
            location: location.into(),
            state: BackupState::InProgress,
            size_bytes: 0,
            last_increment_at: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Check if this is an incremental backup.
    #[must_use]
    pub const fn is_incremental(&self) -> bool {
        self.base_backup.is_some()
    }

    /// Move to a terminal state. Only `InProgress` jobs can move, and each
    /// job does so exactly once.
    pub fn transition(&mut self, state: BackupState) -> Result<()> {
        if self.state.is_terminal() || !state.is_terminal() {
            return Err(Error::invariant_violation(format!(
                "backup {} cannot move from {} to {state}",
                self.uuid, self.state
            )));
        }
        self.state = state;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Lifecycle of a restore job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreState {
    /// Owned by a running task.
    InProgress,
    /// Data restored.
    Completed,
    /// The task failed.
    Failed,
    /// The task was aborted.
    Aborted,
}

impl RestoreState {
    /// Check if the state is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One restore of a backup into a universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreJob {
    /// Restore ID.
    pub uuid: Uuid,
    /// Backup being restored.
    pub backup: Uuid,
    /// Universe restored into.
    pub universe: Uuid,
    /// Task that runs the restore.
    pub task: Uuid,
    /// Lifecycle state.
    pub state: RestoreState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl RestoreJob {
    /// Create an in-progress restore owned by `task`.
    #[must_use]
    pub fn new(uuid: Uuid, backup: Uuid, universe: Uuid, task: Uuid) -> Self {
        Self {
            uuid,
            backup,
            universe,
            task,
            state: RestoreState::InProgress,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a terminal state, once.
    pub fn transition(&mut self, state: RestoreState) -> Result<()> {
        if self.state.is_terminal() || !state.is_terminal() {
            return Err(Error::invariant_violation(format!(
                "restore {} cannot move from {:?} to {state:?}",
                self.uuid, self.state
            )));
        }
        self.state = state;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}
