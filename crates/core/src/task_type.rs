//! Task-type tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Every kind of cluster-mutation task the engine knows how to run.
///
/// The executor keeps one worker pool per variant, and the replication
/// state machine gates on these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    /// Add, remove or replace nodes of a universe.
    EditUniverse,
    /// Take a full or incremental backup.
    CreateBackup,
    /// Restore a backup into a universe.
    RestoreBackup,
    /// Create a replication config between two universes.
    SetupReplication,
    /// Add/remove tables or pause/resume a replication config.
    EditReplication,
    /// Tear down and re-create the replication streams of a config.
    RestartReplication,
    /// Delete a replication config.
    DeleteReplication,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::EditUniverse,
        Self::CreateBackup,
        Self::RestoreBackup,
        Self::SetupReplication,
        Self::EditReplication,
        Self::RestartReplication,
        Self::DeleteReplication,
    ];

    /// Stable name used in configuration and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EditUniverse => "EditUniverse",
            Self::CreateBackup => "CreateBackup",
            Self::RestoreBackup => "RestoreBackup",
            Self::SetupReplication => "SetupReplication",
            Self::EditReplication => "EditReplication",
            Self::RestartReplication => "RestartReplication",
            Self::DeleteReplication => "DeleteReplication",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config(format!("unknown task type '{s}'")))
    }
}
