//! Scheduled backups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::{Error, Result, TaskType};
use conductor_workflow::{TaskExecutor, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::BackupState;
use super::store::BackupStore;
use crate::resource::ResourceStore;
use crate::tasks::CreateBackupParams;

/// A recurring backup of one keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Schedule ID.
    pub uuid: Uuid,
    /// Universe to back up.
    pub universe: Uuid,
    /// Keyspace to back up.
    pub keyspace: String,
    /// Take incremental backups on top of the newest full one.
    pub incremental: bool,
    /// Storage location prefix.
    pub location: String,
    /// A full backup was due but could not be taken.
    pub backlog: bool,
    /// Task of the most recent run.
    pub active_task: Option<TaskId>,
    /// When the most recent run was submitted.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Create a full-backup schedule.
    pub fn new(universe: Uuid, keyspace: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            universe,
            keyspace: keyspace.into(),
            incremental: false,
            location: location.into(),
            backlog: false,
            active_task: None,
            last_run_at: None,
        }
    }

    /// Take incremental backups.
    #[must_use]
    pub const fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }
}

/// Why a scheduled run did not submit a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Scheduled backups are turned off.
    Disabled,
    /// The previous run of this schedule has not finished.
    PreviousRunActive,
    /// The universe is paused.
    UniversePaused,
    /// Backups are turned off for the universe.
    BackupsDisabled,
    /// Another task holds the universe lock.
    UniverseLocked,
}

/// Result of one scheduled invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A backup task was submitted.
    Submitted(TaskId),
    /// Nothing was submitted.
    Skipped(SkipReason),
    /// The universe no longer exists; the schedule was deleted.
    ScheduleDeleted,
}

/// Turns schedules into backup tasks.
#[derive(Clone)]
pub struct BackupScheduler {
    backups: Arc<dyn BackupStore>,
    universes: Arc<dyn ResourceStore>,
    executor: TaskExecutor,
    enabled: bool,
}

impl BackupScheduler {
    /// Create a scheduler.
    pub fn new(
        backups: Arc<dyn BackupStore>,
        universes: Arc<dyn ResourceStore>,
        executor: TaskExecutor,
        enabled: bool,
    ) -> Self {
        Self {
            backups,
            universes,
            executor,
            enabled,
        }
    }

    /// Run one schedule now.
    pub async fn run_scheduled_backup(&self, schedule: Uuid) -> Result<ScheduleOutcome> {
        let schedule = self
            .backups
            .get_schedule(schedule)
            .await?
            .ok_or_else(|| Error::not_found("schedule", schedule.to_string()))?;

        let Some(universe) = self.universes.get(schedule.universe).await? else {
            info!(schedule = %schedule.uuid, universe = %schedule.universe, "Universe is gone, deleting schedule");
            self.backups.remove_schedule(schedule.uuid).await?;
            return Ok(ScheduleOutcome::ScheduleDeleted);
        };

        if !self.enabled {
            debug!(schedule = %schedule.uuid, "Scheduled backups disabled");
            return Ok(ScheduleOutcome::Skipped(SkipReason::Disabled));
        }

        let base_backup = if schedule.incremental {
            self.latest_full_backup(&schedule).await?
        } else {
            None
        };

        let skip = if self.previous_run_active(&schedule).await {
            Some(SkipReason::PreviousRunActive)
        } else if universe.paused {
            Some(SkipReason::UniversePaused)
        } else if !universe.backups_enabled {
            Some(SkipReason::BackupsDisabled)
        } else if universe.update_in_progress {
            Some(SkipReason::UniverseLocked)
        } else {
            None
        };

        if let Some(reason) = skip {
            let backup_wanted = !universe.paused && universe.backups_enabled;
            // Increments are re-evaluated on every tick, so only a missed
            // full backup is remembered.
            if backup_wanted && base_backup.is_none() {
                self.backups
                    .update_schedule(schedule.uuid, Box::new(|s| s.backlog = true))
                    .await?;
            }
            warn!(schedule = %schedule.uuid, universe = %universe.uuid, ?reason, "Skipping scheduled backup");
            return Ok(ScheduleOutcome::Skipped(reason));
        }

        let params = CreateBackupParams {
            universe: schedule.universe,
            keyspace: schedule.keyspace.clone(),
            location: schedule.location.clone(),
            base_backup,
            schedule: Some(schedule.uuid),
        };
        let task = self
            .executor
            .submit(TaskType::CreateBackup, serde_json::to_value(&params)?)
            .await?;

        self.backups
            .update_schedule(
                schedule.uuid,
                Box::new(move |s| {
                    s.active_task = Some(task);
                    s.backlog = false;
                    s.last_run_at = Some(Utc::now());
                }),
            )
            .await?;
        info!(schedule = %schedule.uuid, task_id = %task, incremental = base_backup.is_some(), "Scheduled backup submitted");
        Ok(ScheduleOutcome::Submitted(task))
    }

    /// Run every schedule once. Failures of one schedule do not stop the
    /// others.
    pub async fn run_all(&self) -> Result<Vec<(Uuid, Result<ScheduleOutcome>)>> {
        let mut outcomes = Vec::new();
        for schedule in self.backups.list_schedules().await? {
            let outcome = self.run_scheduled_backup(schedule.uuid).await;
            if let Err(e) = &outcome {
                warn!(schedule = %schedule.uuid, error = %e, "Scheduled backup failed to start");
            }
            outcomes.push((schedule.uuid, outcome));
        }
        Ok(outcomes)
    }

    async fn previous_run_active(&self, schedule: &Schedule) -> bool {
        let Some(task) = schedule.active_task else {
            return false;
        };
        self.executor
            .progress(task)
            .await
            .is_ok_and(|p| !p.status.is_terminal())
    }

    async fn latest_full_backup(&self, schedule: &Schedule) -> Result<Option<Uuid>> {
        Ok(self
            .backups
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| {
                b.schedule == Some(schedule.uuid)
                    && !b.is_incremental()
                    && b.state == BackupState::Completed
            })
            .max_by_key(|b| b.created_at)
            .map(|b| b.uuid))
    }
}
