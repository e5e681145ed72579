//! Durable storage of backups, restores and schedules.

use std::collections::HashMap;

use async_trait::async_trait;
use conductor_core::{Error, Result};
use itertools::Itertools;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::job::{BackupJob, BackupState, RestoreJob, RestoreState};
use super::schedule::Schedule;

/// A fallible mutation of a stored backup.
pub type BackupUpdate = Box<dyn FnOnce(&mut BackupJob) -> Result<()> + Send>;
/// A fallible mutation of a stored restore.
pub type RestoreUpdate = Box<dyn FnOnce(&mut RestoreJob) -> Result<()> + Send>;
/// A mutation of a stored schedule.
pub type ScheduleUpdate = Box<dyn FnOnce(&mut Schedule) + Send>;

/// Backup, restore and schedule records.
///
/// Updates are all-or-nothing: when the closure fails the stored record is
/// left untouched.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Insert or replace a backup.
    async fn put_backup(&self, job: BackupJob) -> Result<()>;

    /// Load a backup.
    async fn get_backup(&self, uuid: Uuid) -> Result<Option<BackupJob>>;

    /// All backups, oldest first.
    async fn list_backups(&self) -> Result<Vec<BackupJob>>;

    /// Apply a mutation to a backup.
    async fn update_backup(&self, uuid: Uuid, update: BackupUpdate) -> Result<BackupJob>;

    /// Insert or replace a restore.
    async fn put_restore(&self, job: RestoreJob) -> Result<()>;

    /// Load a restore.
    async fn get_restore(&self, uuid: Uuid) -> Result<Option<RestoreJob>>;

    /// All restores, oldest first.
    async fn list_restores(&self) -> Result<Vec<RestoreJob>>;

    /// Apply a mutation to a restore.
    async fn update_restore(&self, uuid: Uuid, update: RestoreUpdate) -> Result<RestoreJob>;

    /// Insert or replace a schedule.
    async fn put_schedule(&self, schedule: Schedule) -> Result<()>;

    /// Load a schedule.
    async fn get_schedule(&self, uuid: Uuid) -> Result<Option<Schedule>>;

    /// All schedules, sorted by UUID.
    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    /// Delete a schedule.
    async fn remove_schedule(&self, uuid: Uuid) -> Result<Option<Schedule>>;

    /// Apply a mutation to a schedule.
    async fn update_schedule(&self, uuid: Uuid, update: ScheduleUpdate) -> Result<Schedule>;

    /// Backups created by a task.
    async fn backups_for_task(&self, task: Uuid) -> Result<Vec<BackupJob>> {
        Ok(self
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| b.task == task)
            .collect())
    }

    /// Move every in-progress backup created by `task` to `state`.
    /// Returns the backups that moved.
    async fn finalize_task_backups(&self, task: Uuid, state: BackupState) -> Result<Vec<Uuid>> {
        let mut moved = Vec::new();
        for job in self.backups_for_task(task).await? {
            if job.state.is_terminal() {
                continue;
            }
            self.update_backup(job.uuid, Box::new(move |b| b.transition(state)))
                .await?;
            info!(backup = %job.uuid, %state, "Backup finalized");
            moved.push(job.uuid);
        }
        Ok(moved)
    }

    /// Move every in-progress restore run by `task` to `state`.
    async fn finalize_task_restores(&self, task: Uuid, state: RestoreState) -> Result<Vec<Uuid>> {
        let mut moved = Vec::new();
        for job in self.list_restores().await? {
            if job.task != task || job.state.is_terminal() {
                continue;
            }
            self.update_restore(job.uuid, Box::new(move |r| r.transition(state)))
                .await?;
            info!(restore = %job.uuid, ?state, "Restore finalized");
            moved.push(job.uuid);
        }
        Ok(moved)
    }
}

/// In-memory backup store.
#[derive(Default)]
pub struct InMemoryBackupStore {
    backups: RwLock<HashMap<Uuid, BackupJob>>,
    restores: RwLock<HashMap<Uuid, RestoreJob>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl InMemoryBackupStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply<T: Clone>(slot: &mut T, update: impl FnOnce(&mut T) -> Result<()>) -> Result<T> {
    let mut staged = slot.clone();
    update(&mut staged)?;
    *slot = staged.clone();
    Ok(staged)
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn put_backup(&self, job: BackupJob) -> Result<()> {
        self.backups.write().await.insert(job.uuid, job);
        Ok(())
    }

    async fn get_backup(&self, uuid: Uuid) -> Result<Option<BackupJob>> {
        Ok(self.backups.read().await.get(&uuid).cloned())
    }

    async fn list_backups(&self) -> Result<Vec<BackupJob>> {
        Ok(self
            .backups
            .read()
            .await
            .values()
            .sorted_by_key(|b| (b.created_at, b.uuid))
            .cloned()
            .collect())
    }

    async fn update_backup(&self, uuid: Uuid, update: BackupUpdate) -> Result<BackupJob> {
        let mut backups = self.backups.write().await;
        let job = backups
            .get_mut(&uuid)
            .ok_or_else(|| Error::not_found("backup", uuid.to_string()))?;
        apply(job, update)
    }

    async fn put_restore(&self, job: RestoreJob) -> Result<()> {
        self.restores.write().await.insert(job.uuid, job);
        Ok(())
    }

    async fn get_restore(&self, uuid: Uuid) -> Result<Option<RestoreJob>> {
        Ok(self.restores.read().await.get(&uuid).cloned())
    }

    async fn list_restores(&self) -> Result<Vec<RestoreJob>> {
        Ok(self
            .restores
            .read()
            .await
            .values()
            .sorted_by_key(|r| (r.created_at, r.uuid))
            .cloned()
            .collect())
    }

    async fn update_restore(&self, uuid: Uuid, update: RestoreUpdate) -> Result<RestoreJob> {
        let mut restores = self.restores.write().await;
        let job = restores
            .get_mut(&uuid)
            .ok_or_else(|| Error::not_found("restore", uuid.to_string()))?;
        apply(job, update)
    }

    async fn put_schedule(&self, schedule: Schedule) -> Result<()> {
        self.schedules.write().await.insert(schedule.uuid, schedule);
        Ok(())
    }

    async fn get_schedule(&self, uuid: Uuid) -> Result<Option<Schedule>> {
        Ok(self.schedules.read().await.get(&uuid).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .sorted_by_key(|s| s.uuid)
            .cloned()
            .collect())
    }

    async fn remove_schedule(&self, uuid: Uuid) -> Result<Option<Schedule>> {
        Ok(self.schedules.write().await.remove(&uuid))
    }

    async fn update_schedule(&self, uuid: Uuid, update: ScheduleUpdate) -> Result<Schedule> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&uuid)
            .ok_or_else(|| Error::not_found("schedule", uuid.to_string()))?;
        update(schedule);
        Ok(schedule.clone())
    }
}
