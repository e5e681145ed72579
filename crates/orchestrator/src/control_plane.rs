//! Wiring of stores, capabilities, executor and scheduler.

use std::sync::Arc;

use conductor_core::{ConductorConfig, Result, TaskType};
use conductor_workflow::{InMemoryTaskStore, TaskExecutor, TaskId, TaskProgress, TaskStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::backup::{BackupScheduler, InMemoryBackupStore};
use crate::lock::ResourceLock;
use crate::replication::{AllowedTasks, InMemoryReplicationStore};
use crate::resource::{InMemoryResourceStore, ResourceStore};
use crate::sim::SimulatedCluster;
use crate::tasks::{Services, task_registry};

/// A running control plane.
#[derive(Clone)]
pub struct ControlPlane {
    services: Services,
    executor: TaskExecutor,
    scheduler: BackupScheduler,
}

impl ControlPlane {
    /// Build a control plane over existing stores and capabilities.
    pub fn new(services: Services, tasks: Arc<dyn TaskStore>, config: &ConductorConfig) -> Self {
        let executor = TaskExecutor::new(tasks, task_registry(&services), config);
        let scheduler = BackupScheduler::new(
            Arc::clone(&services.backups),
            Arc::clone(&services.universes),
            executor.clone(),
            config.backup.scheduled_enabled,
        );
        Self {
            services,
            executor,
            scheduler,
        }
    }

    /// In-memory stores with every capability backed by one simulated
    /// cluster, which is returned for fault injection.
    #[must_use]
    pub fn simulated(config: &ConductorConfig) -> (Self, SimulatedCluster) {
        let sim = SimulatedCluster::new();
        let plane = Self::simulated_with(config, &sim, Arc::new(InMemoryTaskStore::new()));
        (plane, sim)
    }

    /// Like [`simulated`](Self::simulated), over a given simulated cluster
    /// and task store. Building a second plane over the same task store is
    /// how a process restart is modelled.
    pub fn simulated_with(
        config: &ConductorConfig,
        sim: &SimulatedCluster,
        tasks: Arc<dyn TaskStore>,
    ) -> Self {
        let universes: Arc<dyn ResourceStore> = Arc::new(InMemoryResourceStore::new());
        let services = Services {
            lock: ResourceLock::new(Arc::clone(&universes)),
            universes,
            replication: Arc::new(InMemoryReplicationStore::new()),
            backups: Arc::new(InMemoryBackupStore::new()),
            nodes: Arc::new(sim.clone()),
            clusters: Arc::new(sim.clone()),
            storage: Arc::new(sim.clone()),
            allowed_tasks: Arc::new(AllowedTasks::standard()),
        };
        Self::new(services, tasks, config)
    }

    /// A fresh executor and scheduler over the same stores, as after a
    /// process restart. Tasks still running on `self` are not stopped.
    #[must_use]
    pub fn restarted(&self, config: &ConductorConfig) -> Self {
        Self::new(self.services.clone(), self.executor.store(), config)
    }

    /// Stores and capabilities.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Task executor.
    #[must_use]
    pub const fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Backup scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    /// Submit a task with typed parameters.
    pub async fn submit<P: Serialize + Sync>(&self, task_type: TaskType, params: &P) -> Result<TaskId> {
        self.executor
            .submit(task_type, serde_json::to_value(params)?)
            .await
    }

    /// Submit a task and wait for its terminal progress.
    pub async fn run<P: Serialize + Sync>(&self, task_type: TaskType, params: &P) -> Result<TaskProgress> {
        let id = self.submit(task_type, params).await?;
        self.executor.wait_for_completion(id).await
    }

    /// Startup recovery.
    ///
    /// No task runs in a fresh process, so every universe still marked as
    /// locked was left behind by a task that died with the previous
    /// process. Those locks are cleared, then the incomplete tasks resume
    /// from their checkpoints.
    pub async fn recover(&self) -> Result<Vec<TaskId>> {
        let orphaned: Vec<_> = self
            .services
            .universes
            .list()
            .await?
            .into_iter()
            .filter(|u| u.update_in_progress)
            .map(|u| u.uuid)
            .collect();
        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "Clearing locks left by a previous process");
            self.services
                .lock
                .release_all(&orphaned, Some("control plane restarted"))
                .await;
        }

        let resumed = self.executor.resume_incomplete().await?;
        info!(resumed = resumed.len(), "Recovery complete");
        Ok(resumed)
    }
}
