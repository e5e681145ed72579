//! Task bodies for every task type, and the registry wiring them up.

pub mod create_backup;
pub mod edit_universe;
pub mod replication;
pub mod restore_backup;
pub mod steps;

use std::sync::Arc;

use conductor_core::{Result, TaskType};
use conductor_workflow::{TaskBody, TaskRegistry};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use create_backup::{CreateBackup, CreateBackupParams};
pub use edit_universe::{EditPlan, EditUniverse, EditUniverseParams, NodeSpec, plan_edit};
pub use replication::{
    DeleteReplication, EditReplication, EditReplicationParams, ReplicationConfigParams,
    RestartReplication, SetupReplication, SetupReplicationParams,
};
pub use restore_backup::{RestoreBackup, RestoreBackupParams};

use crate::backup::BackupStore;
use crate::capability::{BackupStorage, ClusterClientProvider, NodeOperations};
use crate::lock::ResourceLock;
use crate::replication::{AllowedTasks, ReplicationStore};
use crate::resource::ResourceStore;

/// Everything a task body talks to.
#[derive(Clone)]
pub struct Services {
    /// Universe records.
    pub universes: Arc<dyn ResourceStore>,
    /// Lock protocol over `universes`.
    pub lock: ResourceLock,
    /// Replication configs.
    pub replication: Arc<dyn ReplicationStore>,
    /// Backup, restore and schedule records.
    pub backups: Arc<dyn BackupStore>,
    /// Node-operation capability.
    pub nodes: Arc<dyn NodeOperations>,
    /// Cluster-session capability.
    pub clusters: Arc<dyn ClusterClientProvider>,
    /// Backup storage capability.
    pub storage: Arc<dyn BackupStorage>,
    /// Replication status gate.
    pub allowed_tasks: Arc<AllowedTasks>,
}

fn decode<P: DeserializeOwned>(params: &Value) -> Result<P> {
    Ok(serde_json::from_value(params.clone())?)
}

/// Register a body for every task type.
#[must_use]
pub fn task_registry(services: &Services) -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    let s = services.clone();
    registry.register(TaskType::EditUniverse, move |params: &Value| {
        Ok(Box::new(EditUniverse::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });
    let s = services.clone();
    registry.register(TaskType::CreateBackup, move |params: &Value| {
        Ok(Box::new(CreateBackup::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });
    let s = services.clone();
    registry.register(TaskType::RestoreBackup, move |params: &Value| {
        Ok(Box::new(RestoreBackup::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });
    let s = services.clone();
    registry.register(TaskType::SetupReplication, move |params: &Value| {
        Ok(Box::new(SetupReplication::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });
    let s = services.clone();
    registry.register(TaskType::EditReplication, move |params: &Value| {
        Ok(Box::new(EditReplication::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });
    let s = services.clone();
    registry.register(TaskType::RestartReplication, move |params: &Value| {
        Ok(Box::new(RestartReplication::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });
    let s = services.clone();
    registry.register(TaskType::DeleteReplication, move |params: &Value| {
        Ok(Box::new(DeleteReplication::new(s.clone(), decode(params)?)) as Box<dyn TaskBody>)
    });

    registry
}
