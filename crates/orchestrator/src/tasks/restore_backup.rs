//! Restore a completed backup into a universe.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{Error, Result, ResultExt};
use conductor_workflow::{RunnableTask, SubtaskGroup, TaskBody, fn_step};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::Services;
use super::steps::{ClusterRpcStep, mark_update_success};
use crate::backup::{BackupJob, BackupState, RestoreJob, RestoreState};
use crate::capability::{BackupStorage, ClusterRpc, with_cluster_client};
use crate::lock::LockSet;
use crate::resource::ExpectedVersion;

/// Parameters of a restore task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreBackupParams {
    /// Backup to restore.
    pub backup: Uuid,
    /// Universe to restore into.
    pub universe: Uuid,
    /// Keyspace to restore into; defaults to the backed-up keyspace.
    #[serde(default)]
    pub keyspace: Option<String>,
}

/// Restore task body.
pub struct RestoreBackup {
    services: Services,
    params: RestoreBackupParams,
    locks: LockSet,
}

impl RestoreBackup {
    /// Create the body.
    pub fn new(services: Services, params: RestoreBackupParams) -> Self {
        let locks = LockSet::new(services.lock.clone());
        Self {
            services,
            params,
            locks,
        }
    }

    async fn completed_backup(&self) -> Result<BackupJob> {
        let backup = self
            .services
            .backups
            .get_backup(self.params.backup)
            .await?
            .ok_or_else(|| Error::not_found("backup", self.params.backup.to_string()))?;
        if backup.state != BackupState::Completed {
            return Err(Error::invariant_violation(format!(
                "backup {} is {}, only completed backups can be restored",
                backup.uuid, backup.state
            )));
        }
        Ok(backup)
    }

    fn load_balancer_group(&self, name: &str, enabled: bool) -> SubtaskGroup {
        SubtaskGroup::new(name).step(ClusterRpcStep::shared(
            &self.services.clusters,
            self.params.universe,
            ClusterRpc::SetLoadBalancer { enabled },
        ))
    }
}

#[async_trait]
impl TaskBody for RestoreBackup {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.universe]
    }

    async fn validate(&self) -> Result<()> {
        self.completed_backup().await?;
        self.services
            .universes
            .get(self.params.universe)
            .await?
            .ok_or_else(|| Error::not_found("universe", self.params.universe.to_string()))?;
        Ok(())
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let universe = self.params.universe;
        self.locks.acquire(universe, ExpectedVersion::Any).await?;
        let backup = self.completed_backup().await?;

        let restore: Uuid = task.snapshot(|| async { Ok(Uuid::new_v4()) }).await?;
        match self.services.backups.get_restore(restore).await? {
            Some(job) if job.state.is_terminal() => {
                return Err(Error::invariant_violation(format!(
                    "restore {restore} of task {} already finished as {:?}",
                    task.id(),
                    job.state
                )));
            }
            Some(_) => {}
            None => {
                let job = RestoreJob::new(restore, backup.uuid, universe, task.id().as_uuid());
                self.services.backups.put_restore(job).await?;
                info!(task_id = %task.id(), restore = %restore, backup = %backup.uuid, "Restore started");
            }
        }

        task.add_subtask_group(self.load_balancer_group("disable-load-balancer", false))
            .await?;

        let storage: Arc<dyn BackupStorage> = Arc::clone(&self.services.storage);
        let (backup_id, location) = (backup.uuid, backup.location.clone());
        task.add_subtask_group(SubtaskGroup::new("download-backup").step(fn_step(
            "download_backup",
            move |ctx| {
                let storage = Arc::clone(&storage);
                let location = location.clone();
                async move {
                    ctx.check_cancelled()?;
                    storage.download(universe, backup_id, &location).await
                }
            },
        )))
        .await?;

        let keyspace = self.params.keyspace.clone().unwrap_or(backup.keyspace);
        task.add_subtask_group(SubtaskGroup::new("restore-snapshot").step(ClusterRpcStep::shared(
            &self.services.clusters,
            universe,
            ClusterRpc::RestoreSnapshot {
                backup: backup_id,
                keyspace,
            },
        )))
        .await?;

        task.add_subtask_group(self.load_balancer_group("enable-load-balancer", true))
            .await?;
        task.add_subtask_group(
            SubtaskGroup::new("mark-update-success")
                .step(mark_update_success(&self.services.universes, universe)),
        )
        .await?;

        task.run_subtasks(false).await?;

        self.services
            .backups
            .update_restore(restore, Box::new(|r| r.transition(RestoreState::Completed)))
            .await?;
        info!(task_id = %task.id(), restore = %restore, "Restore completed");
        Ok(())
    }

    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        let mut finalized = Ok(());
        if let Some(e) = error {
            let state = if e.is_cancelled() {
                RestoreState::Aborted
            } else {
                RestoreState::Failed
            };
            finalized = self
                .services
                .backups
                .finalize_task_restores(task.id().as_uuid(), state)
                .await
                .map(|_| ());

            if self.locks.holds(self.params.universe) {
                with_cluster_client(
                    self.services.clusters.as_ref(),
                    self.params.universe,
                    |session| async move {
                        session.call(ClusterRpc::SetLoadBalancer { enabled: true }).await
                    },
                )
                .await
                .warn_on_err("Could not re-enable load balancer after restore");
            }
        }

        let message = error.map(ToString::to_string);
        self.locks.release_all(message.as_deref()).await;
        finalized
    }
}
