//! Storage trait for durable task records.
//!
//! Every group append and step state change is written through before the
//! engine moves on, so a process that dies mid-task leaves a record from
//! which the next attempt can tell exactly which groups already completed.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{Error, Result};
use itertools::Itertools;
use tokio::sync::RwLock;

use crate::types::{GroupRecord, StepRecord, TaskId, TaskRecord, TaskSnapshot, TaskStatus};

/// Trait for task storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task record. Fails if the ID is already known.
    async fn create_task(&self, task: &TaskRecord) -> Result<()>;

    /// Load a task by ID.
    async fn load_task(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// List all tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Start a new attempt: bump the attempt counter, set `Running`, clear
    /// the previous error. Returns the updated record.
    async fn begin_attempt(&self, id: TaskId) -> Result<TaskRecord>;

    /// Set the task status, recording the error message if any.
    async fn update_status(&self, id: TaskId, status: TaskStatus, error: Option<String>)
    -> Result<()>;

    /// Append a group. The group index must equal the current group count.
    async fn append_group(&self, id: TaskId, group: &GroupRecord) -> Result<()>;

    /// Overwrite one step of a recorded group.
    async fn update_step(&self, id: TaskId, group_index: usize, step: &StepRecord) -> Result<()>;

    /// Persist the first-attempt snapshot. Write-once.
    async fn save_snapshot(&self, id: TaskId, snapshot: &TaskSnapshot) -> Result<()>;
}

/// In-memory storage implementation.
///
/// Survives an executor being dropped and rebuilt, which is how tests model
/// a process restart.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(id: TaskId) -> Error {
    Error::not_found("task", id.to_string())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &TaskRecord) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(Error::storage_failed(
                "create_task",
                format!("task {} already exists", task.id),
            ));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .sorted_by_key(|t| t.created_at)
            .cloned()
            .collect_vec())
    }

    async fn begin_attempt(&self, id: TaskId) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| missing(id))?;
        if !task.status.can_transition_to(TaskStatus::Running) {
            return Err(Error::invariant_violation(format!(
                "task {id} cannot start an attempt from status {}",
                task.status
            )));
        }
        task.attempt += 1;
        task.status = TaskStatus::Running;
        task.error = None;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| missing(id))?;
        if task.status != status && !task.status.can_transition_to(status) {
            return Err(Error::invariant_violation(format!(
                "task {id} cannot move from {} to {status}",
                task.status
            )));
        }
        task.status = status;
        task.error = error;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn append_group(&self, id: TaskId, group: &GroupRecord) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| missing(id))?;
        if group.index != task.groups.len() {
            return Err(Error::invariant_violation(format!(
                "group '{}' appended at index {} but task {id} has {} groups",
                group.name,
                group.index,
                task.groups.len()
            )));
        }
        task.groups.push(group.clone());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_step(&self, id: TaskId, group_index: usize, step: &StepRecord) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| missing(id))?;
        let slot = task
            .groups
            .get_mut(group_index)
            .and_then(|g| g.steps.get_mut(step.ordinal))
            .ok_or_else(|| {
                Error::not_found("step", format!("{id}/{group_index}/{}", step.ordinal))
            })?;
        *slot = step.clone();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn save_snapshot(&self, id: TaskId, snapshot: &TaskSnapshot) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| missing(id))?;
        if task.snapshot.is_some() {
            return Err(Error::invariant_violation(format!(
                "snapshot of task {id} is already recorded"
            )));
        }
        task.snapshot = Some(snapshot.clone());
        task.updated_at = Utc::now();
        Ok(())
    }
}
