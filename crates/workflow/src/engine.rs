//! Task executor.
//!
//! The executor owns one bounded worker pool per task type, runs each task
//! body through its two error-handling tiers, and records the final status.
//! Each body runs inside `catch_unwind`, so a panicking body marks its own
//! task failed without taking down the pool.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{ConductorConfig, Error, Result, ResultExt, TaskType};
use futures::FutureExt;
use itertools::Itertools;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::storage::TaskStore;
use crate::task::{RunSettings, RunnableTask, panic_message};
use crate::types::{TaskId, TaskProgress, TaskRecord, TaskStatus};

/// The body of a task type.
///
/// `run` is the inner tier: it acquires locks, plans, and runs subtask
/// groups. `compensate` runs only when `run` failed with something other
/// than cancellation and may run further groups. `cleanup` is the outer
/// tier and runs on every path, including success and abort; it releases
/// locks and moves domain records to their terminal states.
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Resources this task mutates, recorded on the task.
    fn resources(&self) -> Vec<Uuid> {
        Vec::new()
    }

    /// Admission check run before the task is recorded or retried.
    async fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Inner tier.
    async fn run(&mut self, task: &mut RunnableTask) -> Result<()>;

    /// Failure compensation.
    async fn compensate(&mut self, task: &mut RunnableTask, error: &Error) -> Result<()> {
        let _ = (task, error);
        Ok(())
    }

    /// Outer tier.
    async fn cleanup(&mut self, task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        let _ = (task, error);
        Ok(())
    }
}

/// Builds a task body from submitted parameters.
pub trait TaskFactory: Send + Sync {
    /// Create a body for one execution.
    fn create(&self, params: &Value) -> Result<Box<dyn TaskBody>>;
}

impl<F> TaskFactory for F
where
    F: Fn(&Value) -> Result<Box<dyn TaskBody>> + Send + Sync,
{
    fn create(&self, params: &Value) -> Result<Box<dyn TaskBody>> {
        self(params)
    }
}

/// Registry of task factories.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    factories: HashMap<TaskType, Arc<dyn TaskFactory>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a task type, replacing any previous one.
    pub fn register(&mut self, task_type: TaskType, factory: impl TaskFactory + 'static) {
        self.factories.insert(task_type, Arc::new(factory));
    }

    /// Get the factory for a task type.
    #[must_use]
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskFactory>> {
        self.factories.get(&task_type).cloned()
    }

    /// Check if a factory exists for a task type.
    #[must_use]
    pub fn has(&self, task_type: TaskType) -> bool {
        self.factories.contains_key(&task_type)
    }

    /// Registered task types, sorted.
    #[must_use]
    pub fn task_types(&self) -> Vec<TaskType> {
        self.factories.keys().copied().sorted().collect()
    }

    fn create(&self, task_type: TaskType, params: &Value) -> Result<Box<dyn TaskBody>> {
        self.get(task_type)
            .ok_or_else(|| Error::not_found("task factory", task_type.as_str()))?
            .create(params)
    }
}

/// Runs tasks on per-type worker pools.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    pools: HashMap<TaskType, Arc<Semaphore>>,
    settings: RunSettings,
    active: RwLock<HashMap<TaskId, CancellationToken>>,
    watchers: RwLock<HashMap<TaskId, Arc<watch::Sender<TaskStatus>>>>,
}

impl TaskExecutor {
    /// Create an executor with pools sized from configuration.
    pub fn new(store: Arc<dyn TaskStore>, registry: TaskRegistry, config: &ConductorConfig) -> Self {
        let pools = TaskType::ALL
            .into_iter()
            .map(|t| (t, Arc::new(Semaphore::new(config.executor.pool_size(t)))))
            .collect();

        Self {
            inner: Arc::new(ExecutorInner {
                store,
                registry,
                pools,
                settings: RunSettings::from(config),
                active: RwLock::new(HashMap::new()),
                watchers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Task store backing this executor.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.inner.store)
    }

    /// Submit a task. Returns as soon as the task is recorded; execution
    /// starts when a slot of the task type's pool frees up.
    pub async fn submit(&self, task_type: TaskType, params: Value) -> Result<TaskId> {
        let body = self.inner.registry.create(task_type, &params)?;
        body.validate().await?;

        let record = TaskRecord::new(task_type, params, body.resources());
        let id = record.id;
        self.inner.store.create_task(&record).await?;
        info!(task_id = %id, %task_type, "Task submitted");

        self.launch(id, task_type, body).await?;
        Ok(id)
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `true` if the task was running (or queued) in this executor.
    /// The task stops at its next group boundary or wait poll.
    pub async fn abort(&self, id: TaskId) -> Result<bool> {
        if let Some(token) = self.inner.active.read().await.get(&id) {
            info!(task_id = %id, "Abort requested");
            token.cancel();
            return Ok(true);
        }
        match self.inner.store.load_task(id).await? {
            Some(_) => Ok(false),
            None => Err(Error::not_found("task", id.to_string())),
        }
    }

    /// Current progress of a task.
    pub async fn progress(&self, id: TaskId) -> Result<TaskProgress> {
        self.inner
            .store
            .load_task(id)
            .await?
            .map(|t| t.progress())
            .ok_or_else(|| Error::not_found("task", id.to_string()))
    }

    /// Progress of every known task, oldest first.
    pub async fn list(&self) -> Result<Vec<TaskProgress>> {
        Ok(self
            .inner
            .store
            .list_tasks()
            .await?
            .iter()
            .map(TaskRecord::progress)
            .collect())
    }

    /// Wait until a task reaches a terminal status.
    pub async fn wait_for_completion(&self, id: TaskId) -> Result<TaskProgress> {
        let watcher = self.inner.watchers.read().await.get(&id).cloned();
        if let Some(sender) = watcher {
            let mut rx = sender.subscribe();
            rx.wait_for(TaskStatus::is_terminal)
                .await
                .map_err(|_| Error::invariant_violation(format!("status channel of {id} closed")))?;
            return self.progress(id).await;
        }

        let progress = self.progress(id).await?;
        if progress.status.is_terminal() {
            Ok(progress)
        } else {
            Err(Error::invariant_violation(format!(
                "task {id} is {} but not running in this executor",
                progress.status
            )))
        }
    }

    /// Re-run a failed or aborted task as a new attempt of the same ID.
    pub async fn retry(&self, id: TaskId) -> Result<TaskId> {
        let record = self
            .inner
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| Error::not_found("task", id.to_string()))?;
        if !matches!(record.status, TaskStatus::Failure | TaskStatus::Aborted) {
            return Err(Error::invariant_violation(format!(
                "task {id} in status {} cannot be retried",
                record.status
            )));
        }

        let body = self.inner.registry.create(record.task_type, &record.params)?;
        body.validate().await?;
        info!(task_id = %id, task_type = %record.task_type, attempt = record.attempt + 1, "Retrying task");
        self.launch(id, record.task_type, body).await?;
        Ok(id)
    }

    /// Resume every non-terminal task in the store that is not running here.
    ///
    /// Called once after a restart. Tasks whose body cannot be rebuilt are
    /// marked failed.
    pub async fn resume_incomplete(&self) -> Result<Vec<TaskId>> {
        let mut resumed = Vec::new();
        for record in self.inner.store.list_tasks().await? {
            if record.status.is_terminal() || self.inner.active.read().await.contains_key(&record.id) {
                continue;
            }

            match self.inner.registry.create(record.task_type, &record.params) {
                Ok(body) => {
                    info!(task_id = %record.id, task_type = %record.task_type, attempt = record.attempt, "Resuming task");
                    self.launch(record.id, record.task_type, body).await?;
                    resumed.push(record.id);
                }
                Err(e) => {
                    error!(task_id = %record.id, error = %e, "Cannot resume task");
                    let status = if record.status == TaskStatus::Created {
                        TaskStatus::Aborted
                    } else {
                        TaskStatus::Failure
                    };
                    self.inner
                        .store
                        .update_status(record.id, status, Some(e.to_string()))
                        .await?;
                }
            }
        }
        Ok(resumed)
    }

    async fn launch(
        &self,
        id: TaskId,
        task_type: TaskType,
        body: Box<dyn TaskBody>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active.write().await;
            if active.contains_key(&id) {
                return Err(Error::invariant_violation(format!("task {id} is already running")));
            }
            active.insert(id, cancel.clone());
        }

        let (sender, _) = watch::channel(TaskStatus::Created);
        let status = Arc::new(sender);
        self.inner.watchers.write().await.insert(id, Arc::clone(&status));

        let pool = self
            .inner
            .pools
            .get(&task_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let final_status = match pool.acquire_owned().await {
                Ok(_permit) => inner.execute(id, body, cancel, &status).await,
                Err(_) => {
                    inner
                        .finish(id, Err(Error::invariant_violation("worker pool closed")))
                        .await
                }
            };
            inner.active.write().await.remove(&id);
            status.send_replace(final_status);

            // A retry may already have registered its own sender.
            let mut watchers = inner.watchers.write().await;
            if watchers.get(&id).is_some_and(|w| Arc::ptr_eq(w, &status)) {
                watchers.remove(&id);
            }
        });
        Ok(())
    }
}

impl ExecutorInner {
    async fn execute(
        &self,
        id: TaskId,
        mut body: Box<dyn TaskBody>,
        cancel: CancellationToken,
        status: &watch::Sender<TaskStatus>,
    ) -> TaskStatus {
        if cancel.is_cancelled() {
            return self
                .finish(id, Err(Error::cancelled("aborted before start")))
                .await;
        }

        let record = match self.store.begin_attempt(id).await {
            Ok(record) => record,
            Err(e) => return self.finish(id, Err(e)).await,
        };
        status.send_replace(TaskStatus::Running);

        let span = info_span!(
            "task",
            task_id = %id,
            task_type = %record.task_type,
            attempt = record.attempt
        );
        let mut task = RunnableTask::new(record, Arc::clone(&self.store), cancel, self.settings);

        async {
            debug!("Task attempt started");
            let mut outcome = AssertUnwindSafe(body.run(&mut task))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(Error::invariant_violation(format!(
                        "task body panicked: {}",
                        panic_message(&*panic)
                    )))
                });

            if let Err(e) = &outcome {
                if !e.is_cancelled() {
                    AssertUnwindSafe(body.compensate(&mut task, e))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(Error::invariant_violation(format!(
                                "task compensation panicked: {}",
                                panic_message(&*panic)
                            )))
                        })
                        .warn_on_err("Compensation failed");
                }
            }

            let cleanup = AssertUnwindSafe(body.cleanup(&mut task, outcome.as_ref().err()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(Error::invariant_violation(format!(
                        "task cleanup panicked: {}",
                        panic_message(&*panic)
                    )))
                });
            if let Err(e) = cleanup {
                error!(error = %e, "Task cleanup failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }

            self.finish(id, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn finish(&self, id: TaskId, outcome: Result<()>) -> TaskStatus {
        let (status, message) = match &outcome {
            Ok(()) => {
                info!(task_id = %id, "Task succeeded");
                (TaskStatus::Success, None)
            }
            Err(e) if e.is_cancelled() => {
                warn!(task_id = %id, reason = %e, "Task aborted");
                (TaskStatus::Aborted, Some(e.to_string()))
            }
            Err(e) => {
                error!(task_id = %id, error = %e, kind = e.kind(), "Task failed");
                (TaskStatus::Failure, Some(e.to_string()))
            }
        };

        if let Err(e) = self.store.update_status(id, status, message).await {
            error!(task_id = %id, error = %e, "Failed to record task status");
        }
        status
    }
}
