//! Take a full or incremental backup of one keyspace.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{Error, Result};
use conductor_workflow::{RunnableTask, SubtaskGroup, TaskBody, fn_step};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::Services;
use super::steps::{ClusterRpcStep, mark_update_success};
use crate::backup::{BackupJob, BackupState, BackupStore};
use crate::capability::{BackupStorage, ClusterRpc};
use crate::lock::LockSet;
use crate::resource::ExpectedVersion;

fn default_location() -> String {
    "sim://backups".to_string()
}

/// Parameters of a create-backup task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBackupParams {
    /// Universe to back up.
    pub universe: Uuid,
    /// Keyspace to back up.
    pub keyspace: String,
    /// Storage location prefix.
    #[serde(default = "default_location")]
    pub location: String,
    /// Full backup to increment, making this an incremental backup.
    #[serde(default)]
    pub base_backup: Option<Uuid>,
    /// Schedule that triggered the backup.
    #[serde(default)]
    pub schedule: Option<Uuid>,
}

/// Create-backup task body.
pub struct CreateBackup {
    services: Services,
    params: CreateBackupParams,
    locks: LockSet,
}

impl CreateBackup {
    /// Create the body.
    pub fn new(services: Services, params: CreateBackupParams) -> Self {
        let locks = LockSet::new(services.lock.clone());
        Self {
            services,
            params,
            locks,
        }
    }

    /// Find or create the backup record of this task.
    async fn backup_record(&self, task: &RunnableTask, backup: Uuid) -> Result<BackupJob> {
        if let Some(job) = self.services.backups.get_backup(backup).await? {
            if job.state.is_terminal() && job.state != BackupState::Completed {
                return Err(Error::invariant_violation(format!(
                    "backup {backup} of task {} is already {}",
                    task.id(),
                    job.state
                )));
            }
            return Ok(job);
        }

        let mut job = BackupJob::new(
            backup,
            self.params.universe,
            task.id().as_uuid(),
            self.params.keyspace.clone(),
            format!("{}/{}/{backup}", self.params.location, self.params.universe),
        );
        job.base_backup = self.params.base_backup;
        job.schedule = self.params.schedule;
        self.services.backups.put_backup(job.clone()).await?;
        info!(task_id = %task.id(), backup = %backup, incremental = job.is_incremental(), "Backup started");
        Ok(job)
    }
}

#[async_trait]
impl TaskBody for CreateBackup {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.universe]
    }

    async fn validate(&self) -> Result<()> {
        let universe = self.params.universe;
        self.services
            .universes
            .get(universe)
            .await?
            .ok_or_else(|| Error::not_found("universe", universe.to_string()))?;

        if let Some(base) = self.params.base_backup {
            let base_job = self
                .services
                .backups
                .get_backup(base)
                .await?
                .ok_or_else(|| Error::not_found("backup", base.to_string()))?;
            if base_job.state != BackupState::Completed || base_job.universe != universe {
                return Err(Error::invariant_violation(format!(
                    "backup {base} is not a completed backup of universe {universe}"
                )));
            }
        }
        Ok(())
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let universe = self.params.universe;
        self.locks.acquire(universe, ExpectedVersion::Any).await?;

        let backup: Uuid = task.snapshot(|| async { Ok(Uuid::new_v4()) }).await?;
        let job = self.backup_record(task, backup).await?;
        if job.state == BackupState::Completed {
            info!(task_id = %task.id(), backup = %backup, "Backup already completed by an earlier attempt");
            return Ok(());
        }

        task.add_subtask_group(SubtaskGroup::new("create-snapshot").step(ClusterRpcStep::shared(
            &self.services.clusters,
            universe,
            ClusterRpc::CreateSnapshot {
                backup,
                keyspace: job.keyspace.clone(),
            },
        )))
        .await?;

        let storage: Arc<dyn BackupStorage> = Arc::clone(&self.services.storage);
        let backups: Arc<dyn BackupStore> = Arc::clone(&self.services.backups);
        let location = job.location.clone();
        task.add_subtask_group(SubtaskGroup::new("upload-backup").step(fn_step(
            "upload_backup",
            move |ctx| {
                let storage = Arc::clone(&storage);
                let backups = Arc::clone(&backups);
                let location = location.clone();
                async move {
                    ctx.check_cancelled()?;
                    let size = storage.upload(universe, backup, &location).await?;
                    backups
                        .update_backup(
                            backup,
                            Box::new(move |b| {
                                b.size_bytes = size;
                                Ok(())
                            }),
                        )
                        .await?;
                    Ok(())
                }
            },
        )))
        .await?;

        task.add_subtask_group(
            SubtaskGroup::new("mark-update-success")
                .step(mark_update_success(&self.services.universes, universe)),
        )
        .await?;

        task.run_subtasks(false).await?;

        let completed = self
            .services
            .backups
            .update_backup(backup, Box::new(|b| b.transition(BackupState::Completed)))
            .await?;
        if let Some(base) = completed.base_backup {
            let at = completed.completed_at.unwrap_or_else(Utc::now);
            self.services
                .backups
                .update_backup(
                    base,
                    Box::new(move |b| {
                        b.last_increment_at = Some(at);
                        Ok(())
                    }),
                )
                .await?;
        }
        info!(task_id = %task.id(), backup = %backup, size_bytes = completed.size_bytes, "Backup completed");
        Ok(())
    }

    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        let finalized = match error {
            Some(e) => {
                let state = if e.is_cancelled() {
                    BackupState::Stopped
                } else {
                    BackupState::Failed
                };
                warn!(task_id = %task.id(), error = %e, %state, "Backup task did not complete");
                self.services
                    .backups
                    .finalize_task_backups(task.id().as_uuid(), state)
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };

        let message = error.map(ToString::to_string);
        self.locks.release_all(message.as_deref()).await;
        finalized
    }
}
