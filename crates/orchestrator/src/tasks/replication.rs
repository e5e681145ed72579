//! Replication tasks: setup, edit, restart and delete.
//!
//! Every task locks both sides of the config in ascending order. The
//! allowed-task table is checked at admission and again when a first
//! attempt starts; later attempts skip the check because the config is
//! legitimately sitting in `Updating` from the attempt that failed.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{Error, Result, TaskType};
use conductor_workflow::{RunnableTask, Step, SubtaskGroup, TaskBody, fn_step};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::Services;
use super::steps::{ClusterRpcStep, mark_update_success};
use crate::capability::{ClusterRpc, with_cluster_client};
use crate::lock::LockSet;
use crate::replication::{
    ReplicationConfig, ReplicationStatus, ReplicationStore, TableStatus, connected_universes,
    must_delete,
};

/// A step that mutates the stored config.
fn config_step(
    name: &str,
    store: &Arc<dyn ReplicationStore>,
    config: Uuid,
    update: impl Fn(&mut ReplicationConfig) + Send + Sync + 'static,
) -> Arc<dyn Step> {
    let store = Arc::clone(store);
    let update = Arc::new(update);
    fn_step(name, move |_ctx| {
        let store = Arc::clone(&store);
        let update = Arc::clone(&update);
        async move {
            store.update(config, Box::new(move |c| update(c))).await?;
            Ok(())
        }
    })
}

async fn load_config(services: &Services, uuid: Uuid) -> Result<ReplicationConfig> {
    services
        .replication
        .get(uuid)
        .await?
        .ok_or_else(|| Error::not_found("replication config", uuid.to_string()))
}

fn mark_success_group(services: &Services, config: &ReplicationConfig) -> SubtaskGroup {
    config
        .universes()
        .into_iter()
        .fold(SubtaskGroup::new("mark-update-success"), |group, universe| {
            group.step(mark_update_success(&services.universes, universe))
        })
}

/// Force the config and its unfinished tables to `Failed`.
async fn fail_config(services: &Services, config: Uuid) -> Result<()> {
    if services.replication.get(config).await?.is_none() {
        return Ok(());
    }
    services.replication.fail_pending_tables(config).await?;
    services
        .replication
        .set_status(config, ReplicationStatus::Failed)
        .await?;
    warn!(config = %config, "Replication config marked failed");
    Ok(())
}

/// Shared state of a replication task.
struct ReplicationTask {
    services: Services,
    locks: LockSet,
    config: Option<Uuid>,
}

impl ReplicationTask {
    fn new(services: Services) -> Self {
        let locks = LockSet::new(services.lock.clone());
        Self {
            services,
            locks,
            config: None,
        }
    }

    fn check_allowed(&self, config: &ReplicationConfig, task_type: TaskType) -> Result<()> {
        self.services.allowed_tasks.check(config, task_type)
    }

    /// Lock both sides of a config.
    async fn lock_sides(&mut self, config: &ReplicationConfig) -> Result<()> {
        self.locks.acquire_many(&config.universes()).await?;
        self.config = Some(config.uuid);
        Ok(())
    }

    /// Outer tier shared by setup, edit and restart.
    async fn finish(&mut self, task: &RunnableTask, error: Option<&Error>) -> Result<()> {
        let mut marked = Ok(());
        if let (Some(e), Some(config)) = (error, self.config) {
            warn!(task_id = %task.id(), config = %config, error = %e, "Replication task failed");
            marked = fail_config(&self.services, config).await;
        }
        let message = error.map(ToString::to_string);
        self.locks.release_all(message.as_deref()).await;
        marked
    }
}

/// Parameters of a setup-replication task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupReplicationParams {
    /// Config name.
    pub name: String,
    /// Source universe.
    pub source: Uuid,
    /// Target universe.
    pub target: Uuid,
    /// Tables to replicate.
    pub tables: Vec<String>,
}

/// Create a replication config and its streams.
pub struct SetupReplication {
    base: ReplicationTask,
    params: SetupReplicationParams,
}

impl SetupReplication {
    /// Create the body.
    pub fn new(services: Services, params: SetupReplicationParams) -> Self {
        Self {
            base: ReplicationTask::new(services),
            params,
        }
    }

    async fn existing_config(&self) -> Result<Option<ReplicationConfig>> {
        Ok(self
            .base
            .services
            .replication
            .configs_touching(self.params.source)
            .await?
            .into_iter()
            .find(|c| c.source == self.params.source && c.target == self.params.target))
    }
}

#[async_trait]
impl TaskBody for SetupReplication {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.source, self.params.target]
    }

    async fn validate(&self) -> Result<()> {
        let params = &self.params;
        if params.source == params.target {
            return Err(Error::invariant_violation(format!(
                "universe {} cannot replicate to itself",
                params.source
            )));
        }
        if params.tables.is_empty() {
            return Err(Error::invariant_violation("replication needs at least one table"));
        }
        for universe in [params.source, params.target] {
            self.base
                .services
                .universes
                .get(universe)
                .await?
                .ok_or_else(|| Error::not_found("universe", universe.to_string()))?;
        }
        if let Some(existing) = self.existing_config().await? {
            self.base.check_allowed(&existing, TaskType::SetupReplication)?;
        }
        Ok(())
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let existing = self.existing_config().await?.map(|c| c.uuid);
        let config_id: Uuid = task
            .snapshot(|| async move { Ok(existing.unwrap_or_else(Uuid::new_v4)) })
            .await?;

        let store = Arc::clone(&self.base.services.replication);
        let stored = store.get(config_id).await?;
        if task.is_first_try() {
            if let Some(config) = &stored {
                self.base.check_allowed(config, TaskType::SetupReplication)?;
            }
        }
        let config = stored.unwrap_or_else(|| {
            let mut config = ReplicationConfig::new(
                self.params.name.clone(),
                self.params.source,
                self.params.target,
                self.params.tables.clone(),
            );
            config.uuid = config_id;
            config
        });
        // Nothing is stored until both sides are held.
        self.base.lock_sides(&config).await?;

        let created = config.clone();
        let creator = Arc::clone(&store);
        task.add_subtask_group(SubtaskGroup::new("create-config").step(fn_step(
            "create_config",
            move |_ctx| {
                let store = Arc::clone(&creator);
                let config = created.clone();
                async move {
                    if store.get(config.uuid).await?.is_none() {
                        info!(config = %config.uuid, "Replication config created");
                        store.put(config).await?;
                    }
                    Ok(())
                }
            },
        )))
        .await?;
        task.add_subtask_group(SubtaskGroup::new("set-tables-bootstrapping").step(config_step(
            "set_tables_bootstrapping",
            &store,
            config_id,
            |c| c.set_all_tables(TableStatus::Bootstrapping),
        )))
        .await?;
        task.add_subtask_group(SubtaskGroup::new("setup-replication").step(ClusterRpcStep::shared(
            &self.base.services.clusters,
            config.target,
            ClusterRpc::SetupReplication {
                config: config_id,
                source: config.source,
                tables: config.table_names(),
            },
        )))
        .await?;
        task.add_subtask_group(SubtaskGroup::new("set-replication-running").step(config_step(
            "set_replication_running",
            &store,
            config_id,
            |c| {
                c.set_all_tables(TableStatus::Running);
                c.status = ReplicationStatus::Running;
            },
        )))
        .await?;
        task.add_subtask_group(mark_success_group(&self.base.services, &config))
            .await?;

        task.run_subtasks(false).await
    }

    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        self.base.finish(task, error).await
    }
}

/// Parameters of an edit-replication task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditReplicationParams {
    /// Config to edit.
    pub config: Uuid,
    /// Tables to start replicating.
    #[serde(default)]
    pub add_tables: Vec<String>,
    /// Tables to stop replicating.
    #[serde(default)]
    pub remove_tables: Vec<String>,
    /// Pause (`true`) or resume (`false`) the streams.
    #[serde(default)]
    pub paused: Option<bool>,
}

/// Change the table set or pause state of a running replication.
pub struct EditReplication {
    base: ReplicationTask,
    params: EditReplicationParams,
}

impl EditReplication {
    /// Create the body.
    pub fn new(services: Services, params: EditReplicationParams) -> Self {
        Self {
            base: ReplicationTask::new(services),
            params,
        }
    }
}

#[async_trait]
impl TaskBody for EditReplication {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.config]
    }

    async fn validate(&self) -> Result<()> {
        let config = load_config(&self.base.services, self.params.config).await?;
        self.base.check_allowed(&config, TaskType::EditReplication)?;
        if let Some(table) = self.params.remove_tables.iter().find(|t| !config.tables.contains_key(*t)) {
            return Err(Error::not_found("replicated table", table.clone()));
        }
        if let Some(table) = self.params.add_tables.iter().find(|t| config.tables.contains_key(*t)) {
            return Err(Error::invariant_violation(format!(
                "table {table} is already replicated by config {}",
                config.uuid
            )));
        }
        Ok(())
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let config = load_config(&self.base.services, self.params.config).await?;
        if task.is_first_try() {
            self.base.check_allowed(&config, TaskType::EditReplication)?;
        }
        self.base.lock_sides(&config).await?;

        let store = Arc::clone(&self.base.services.replication);
        let params = self.params.clone();

        let added = params.add_tables.clone();
        task.add_subtask_group(SubtaskGroup::new("set-config-updating").step(config_step(
            "set_config_updating",
            &store,
            config.uuid,
            move |c| {
                c.status = ReplicationStatus::Updating;
                for table in &added {
                    c.tables.insert(table.clone(), TableStatus::Updating);
                }
            },
        )))
        .await?;

        if !params.add_tables.is_empty() || !params.remove_tables.is_empty() {
            task.add_subtask_group(SubtaskGroup::new("alter-replication").step(ClusterRpcStep::shared(
                &self.base.services.clusters,
                config.target,
                ClusterRpc::AlterReplication {
                    config: config.uuid,
                    add_tables: params.add_tables.clone(),
                    remove_tables: params.remove_tables.clone(),
                },
            )))
            .await?;
        }
        if let Some(paused) = params.paused {
            task.add_subtask_group(SubtaskGroup::new("set-replication-paused").step(ClusterRpcStep::shared(
                &self.base.services.clusters,
                config.target,
                ClusterRpc::SetReplicationPaused {
                    config: config.uuid,
                    paused,
                },
            )))
            .await?;
        }

        task.add_subtask_group(SubtaskGroup::new("set-replication-running").step(config_step(
            "set_replication_running",
            &store,
            config.uuid,
            move |c| {
                for table in &params.remove_tables {
                    c.tables.remove(table);
                }
                for table in &params.add_tables {
                    c.tables.insert(table.clone(), TableStatus::Running);
                }
                if let Some(paused) = params.paused {
                    c.paused = paused;
                }
                c.status = ReplicationStatus::Running;
            },
        )))
        .await?;
        task.add_subtask_group(mark_success_group(&self.base.services, &config))
            .await?;

        task.run_subtasks(false).await
    }

    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        self.base.finish(task, error).await
    }
}

/// Parameters of a restart- or delete-replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfigParams {
    /// Config to act on.
    pub config: Uuid,
}

/// Tear the streams down and set them up again.
pub struct RestartReplication {
    base: ReplicationTask,
    params: ReplicationConfigParams,
}

impl RestartReplication {
    /// Create the body.
    pub fn new(services: Services, params: ReplicationConfigParams) -> Self {
        Self {
            base: ReplicationTask::new(services),
            params,
        }
    }
}

#[async_trait]
impl TaskBody for RestartReplication {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.config]
    }

    async fn validate(&self) -> Result<()> {
        let config = load_config(&self.base.services, self.params.config).await?;
        self.base.check_allowed(&config, TaskType::RestartReplication)
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let config = load_config(&self.base.services, self.params.config).await?;
        if task.is_first_try() {
            self.base.check_allowed(&config, TaskType::RestartReplication)?;
        }
        self.base.lock_sides(&config).await?;
        let store = Arc::clone(&self.base.services.replication);

        task.add_subtask_group(SubtaskGroup::new("set-config-updating").step(config_step(
            "set_config_updating",
            &store,
            config.uuid,
            |c| {
                c.status = ReplicationStatus::Updating;
                c.set_all_tables(TableStatus::Updating);
            },
        )))
        .await?;
        // Streams may be missing after a failed setup.
        task.add_subtask_group(
            SubtaskGroup::new("delete-replication")
                .step(ClusterRpcStep::shared(
                    &self.base.services.clusters,
                    config.target,
                    ClusterRpc::DeleteReplication { config: config.uuid },
                ))
                .ignore_errors(),
        )
        .await?;
        task.add_subtask_group(SubtaskGroup::new("setup-replication").step(ClusterRpcStep::shared(
            &self.base.services.clusters,
            config.target,
            ClusterRpc::SetupReplication {
                config: config.uuid,
                source: config.source,
                tables: config.table_names(),
            },
        )))
        .await?;
        task.add_subtask_group(SubtaskGroup::new("set-replication-running").step(config_step(
            "set_replication_running",
            &store,
            config.uuid,
            |c| {
                c.set_all_tables(TableStatus::Running);
                c.status = ReplicationStatus::Running;
            },
        )))
        .await?;
        task.add_subtask_group(mark_success_group(&self.base.services, &config))
            .await?;

        task.run_subtasks(false).await
    }

    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        self.base.finish(task, error).await
    }
}

/// Everything a delete needs, frozen at its first attempt so a later
/// attempt can finish after the config row is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeletePlan {
    config: Uuid,
    source: Uuid,
    target: Uuid,
    must_delete: bool,
    /// Sides that still existed, target first.
    sides: Vec<Uuid>,
    /// Other universes reachable through replication, ascending.
    connected: Vec<Uuid>,
    stream_owner: Option<Uuid>,
}

/// Delete a replication config, its streams, and promote the features
/// the replication held back on every universe it connected.
pub struct DeleteReplication {
    base: ReplicationTask,
    params: ReplicationConfigParams,
}

impl DeleteReplication {
    /// Create the body.
    pub fn new(services: Services, params: ReplicationConfigParams) -> Self {
        Self {
            base: ReplicationTask::new(services),
            params,
        }
    }

    async fn existing(&self, universes: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut existing = Vec::new();
        for &universe in universes {
            if self.base.services.universes.get(universe).await?.is_some() {
                existing.push(universe);
            }
        }
        Ok(existing)
    }

    async fn plan(&self) -> Result<DeletePlan> {
        let services = &self.base.services;
        let config = load_config(services, self.params.config).await?;
        let sides = self.existing(&[config.target, config.source]).await?;
        let all_configs = services.replication.list().await?;
        let connected = self
            .existing(&connected_universes(&all_configs, &config.universes()))
            .await?;
        Ok(DeletePlan {
            config: config.uuid,
            source: config.source,
            target: config.target,
            must_delete: must_delete(&config),
            stream_owner: sides.first().copied(),
            sides,
            connected,
        })
    }
}

#[async_trait]
impl TaskBody for DeleteReplication {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.config]
    }

    async fn validate(&self) -> Result<()> {
        let config = load_config(&self.base.services, self.params.config).await?;
        self.base.check_allowed(&config, TaskType::DeleteReplication)
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let config_id = self.params.config;
        if !task.is_first_try()
            && task.record().snapshot.is_none()
            && self.base.services.replication.get(config_id).await?.is_none()
        {
            info!(task_id = %task.id(), config = %config_id, "Replication config already removed");
            return Ok(());
        }
        let plan: DeletePlan = task.snapshot(|| self.plan()).await?;

        // A deleted universe cannot be locked; the surviving side still is.
        let sides = self.existing(&plan.sides).await?;
        self.base.locks.acquire_many(&sides).await?;
        self.base.config = Some(plan.config);

        let services = self.base.services.clone();
        if !plan.must_delete {
            task.add_subtask_group(SubtaskGroup::new("set-config-updating").step(config_step(
                "set_config_updating",
                &services.replication,
                plan.config,
                |c| c.status = ReplicationStatus::Updating,
            )))
            .await?;
        }
        if let Some(owner) = plan.stream_owner {
            let mut streams = SubtaskGroup::new("delete-streams").step(ClusterRpcStep::shared(
                &services.clusters,
                owner,
                ClusterRpc::DeleteReplication { config: plan.config },
            ));
            if plan.must_delete {
                streams = streams.ignore_errors();
            }
            task.add_subtask_group(streams).await?;
        }
        task.run_subtasks(false).await?;

        let connected = self.existing(&plan.connected).await?;
        info!(task_id = %task.id(), config = %plan.config, connected = connected.len(), "Locking connected universes");
        self.base.locks.acquire_many(&connected).await?;

        let promote_on: Vec<Uuid> = sides.iter().chain(&connected).copied().collect();
        let clusters = Arc::clone(&services.clusters);
        task.add_subtask_group(SubtaskGroup::new("promote-auto-flags").step(fn_step(
            "promote_auto_flags",
            move |ctx| {
                let clusters = Arc::clone(&clusters);
                let promote_on = promote_on.clone();
                async move {
                    for universe in promote_on {
                        ctx.check_cancelled()?;
                        with_cluster_client(clusters.as_ref(), universe, |session| async move {
                            session.call(ClusterRpc::PromoteAutoFlags).await
                        })
                        .await?;
                    }
                    Ok(())
                }
            },
        )))
        .await?;

        let universes = Arc::clone(&services.universes);
        let marked = sides.clone();
        task.add_subtask_group(SubtaskGroup::new("mark-update-success").step(fn_step(
            "mark_update_success",
            move |_ctx| {
                let universes = Arc::clone(&universes);
                let marked = marked.clone();
                async move {
                    for universe in marked {
                        universes
                            .update_locked(universe, Box::new(|u| u.update_succeeded = true))
                            .await?;
                    }
                    Ok(())
                }
            },
        )))
        .await?;

        let replication = Arc::clone(&services.replication);
        task.add_subtask_group(SubtaskGroup::new("remove-config").step(fn_step(
            "remove_config",
            move |_ctx| {
                let replication = Arc::clone(&replication);
                async move {
                    replication.remove(config_id).await?;
                    Ok(())
                }
            },
        )))
        .await?;

        task.run_subtasks(false).await?;

        self.base.locks.release(plan.target, None).await?;
        self.base.locks.release(plan.source, None).await?;
        let released = self.base.locks.release_all(None).await;
        info!(task_id = %task.id(), config = %config_id, released, "Replication config deleted");
        Ok(())
    }

    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        let mut marked = Ok(());
        if let (Some(e), Some(config)) = (error, self.base.config) {
            warn!(task_id = %task.id(), config = %config, error = %e, "Replication delete failed");
            marked = self.mark_deletion_failed(config).await;
        }
        let message = error.map(ToString::to_string);
        self.base.locks.release_all(message.as_deref()).await;
        marked
    }
}

impl DeleteReplication {
    async fn mark_deletion_failed(&self, config: Uuid) -> Result<()> {
        let Some(current) = self.base.services.replication.get(config).await? else {
            return Ok(());
        };
        if must_delete(&current) {
            return Ok(());
        }
        self.base
            .services
            .replication
            .set_status(config, ReplicationStatus::DeletionFailed)
            .await?;
        Ok(())
    }
}
