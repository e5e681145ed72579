//! Runnable task: ordered subtask groups over a durable record.
//!
//! A task body appends groups with [`RunnableTask::add_subtask_group`] and
//! executes them with [`RunnableTask::run_subtasks`]. Groups run strictly in
//! append order; steps inside one group run concurrently. Every state change
//! is written to the [`TaskStore`] before the next group starts, so a later
//! attempt of the same task skips groups that already succeeded.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use conductor_core::{ConductorConfig, Error, Result, TaskType, WaitConfig};
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{Step, StepContext};
use crate::storage::TaskStore;
use crate::types::{GroupRecord, StepRecord, StepState, TaskId, TaskRecord, TaskSnapshot};

/// An ordered batch of steps that run concurrently.
pub struct SubtaskGroup {
    name: String,
    ignore_errors: bool,
    steps: Vec<Arc<dyn Step>>,
}

impl SubtaskGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ignore_errors: false,
            steps: Vec::new(),
        }
    }

    /// Add a step (builder form).
    #[must_use]
    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a step.
    pub fn add_step(&mut self, step: Arc<dyn Step>) {
        self.steps.push(step);
    }

    /// Log and ignore a failure of this group instead of failing the task.
    #[must_use]
    pub const fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if the group has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn to_record(&self, index: usize, compensation: bool) -> GroupRecord {
        GroupRecord {
            index,
            name: self.name.clone(),
            ignore_errors: self.ignore_errors,
            compensation,
            steps: self
                .steps
                .iter()
                .enumerate()
                .map(|(ordinal, step)| StepRecord::pending(step.name(), ordinal))
                .collect(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Execution limits applied to every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Maximum steps of one group running at the same time.
    pub max_parallel_steps: usize,
    /// Bounded-wait parameters handed to steps.
    pub wait: WaitConfig,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&ConductorConfig::default())
    }
}

impl From<&ConductorConfig> for RunSettings {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            max_parallel_steps: config.executor.max_parallel_steps.max(1),
            wait: config.wait,
        }
    }
}

struct PendingGroup {
    index: usize,
    group: SubtaskGroup,
    completed: bool,
}

/// The running view of one task attempt.
pub struct RunnableTask {
    record: TaskRecord,
    store: Arc<dyn TaskStore>,
    cancel: CancellationToken,
    settings: RunSettings,
    pending: Vec<PendingGroup>,
    next_position: usize,
}

impl RunnableTask {
    /// Wrap a task record for one attempt.
    pub fn new(
        record: TaskRecord,
        store: Arc<dyn TaskStore>,
        cancel: CancellationToken,
        settings: RunSettings,
    ) -> Self {
        Self {
            record,
            store,
            cancel,
            settings,
            pending: Vec::new(),
            next_position: 0,
        }
    }

    /// Task ID.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.record.id
    }

    /// Task type.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.record.task_type
    }

    /// Attempt number (1-based).
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.record.attempt
    }

    /// True on the first attempt, false on every retry or resume.
    #[must_use]
    pub const fn is_first_try(&self) -> bool {
        self.record.attempt <= 1
    }

    /// Durable record as seen by this attempt.
    #[must_use]
    pub const fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// Check if an abort was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation token of this task.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Execution settings.
    #[must_use]
    pub const fn settings(&self) -> RunSettings {
        self.settings
    }

    /// Decode the submitted parameters.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.record.params.clone())?)
    }

    /// Freeze the task plan on the first attempt and reload it on later ones.
    ///
    /// `plan` only runs when no snapshot is recorded yet; retries get the
    /// stored value back even if the live state has changed since.
    pub async fn snapshot<T, F, Fut>(&mut self, plan: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(snapshot) = &self.record.snapshot {
            debug!(task_id = %self.id(), attempt = self.attempt(), "Reusing recorded plan");
            return Ok(serde_json::from_value(snapshot.params.clone())?);
        }

        let value = plan().await?;
        let snapshot = TaskSnapshot::new(serde_json::to_value(&value)?);
        self.store.save_snapshot(self.id(), &snapshot).await?;
        self.record.snapshot = Some(snapshot);
        Ok(value)
    }

    /// Append a group to the task plan.
    ///
    /// On a later attempt the plan group at the same position must carry the
    /// same name and step count as the recorded one; a group that already
    /// succeeded is remembered and skipped by the next `run_subtasks`.
    pub async fn add_subtask_group(&mut self, group: SubtaskGroup) -> Result<()> {
        let position = self.next_position;
        let recorded = self
            .record
            .groups
            .iter()
            .filter(|g| !g.compensation)
            .nth(position);

        let (index, completed) = if let Some(recorded) = recorded {
            if recorded.name != group.name || recorded.steps.len() != group.len() {
                return Err(Error::invariant_violation(format!(
                    "task {} plan diverged at group {position}: recorded '{}' with {} steps, got '{}' with {}",
                    self.id(),
                    recorded.name,
                    recorded.steps.len(),
                    group.name,
                    group.len()
                )));
            }
            (recorded.index, recorded.succeeded())
        } else {
            (self.append_record(&group, false).await?, false)
        };

        debug!(task_id = %self.id(), group = %group.name, position, completed, "Subtask group added");
        self.next_position += 1;
        self.pending.push(PendingGroup {
            index,
            group,
            completed,
        });
        Ok(())
    }

    /// Append a group outside the task plan, typically from failure
    /// compensation. It is always recorded fresh and always runs, even when
    /// an earlier attempt ran a group of the same name.
    pub async fn add_compensation_group(&mut self, group: SubtaskGroup) -> Result<()> {
        let index = self.append_record(&group, true).await?;
        debug!(task_id = %self.id(), group = %group.name, index, "Compensation group added");
        self.pending.push(PendingGroup {
            index,
            group,
            completed: false,
        });
        Ok(())
    }

    async fn append_record(&mut self, group: &SubtaskGroup, compensation: bool) -> Result<usize> {
        let index = self.record.groups.len();
        let record = group.to_record(index, compensation);
        self.store.append_group(self.id(), &record).await?;
        self.record.groups.push(record);
        Ok(index)
    }

    /// Run every group added since the previous call.
    ///
    /// Stops at the first failing group unless `continue_on_failure` is set,
    /// in which case later groups still run and the first error is returned.
    /// Cancellation always stops. Groups marked `ignore_errors` never fail
    /// the task.
    pub async fn run_subtasks(&mut self, continue_on_failure: bool) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut first_error: Option<Error> = None;

        for group in pending {
            if group.completed {
                debug!(task_id = %self.id(), group = %group.group.name, "Skipping group completed by an earlier attempt");
                continue;
            }
            if first_error.is_some() && !continue_on_failure {
                break;
            }
            if self.cancel.is_cancelled() {
                first_error.get_or_insert_with(|| {
                    Error::cancelled(format!("task {} aborted", self.record.id))
                });
                break;
            }

            let ignore_errors = group.group.ignore_errors;
            let name = group.group.name.clone();
            match self.run_group(group).await {
                Ok(()) => {}
                Err(e) if ignore_errors && !e.is_cancelled() => {
                    warn!(task_id = %self.id(), group = %name, error = %e, "Ignoring failure of best-effort group");
                }
                Err(e) => {
                    let stop = e.is_cancelled();
                    first_error.get_or_insert(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn run_group(&mut self, pending: PendingGroup) -> Result<()> {
        let PendingGroup { index, group, .. } = pending;
        let started = Instant::now();
        info!(task_id = %self.id(), group = %group.name, steps = group.len(), "Running subtask group");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_steps));
        let mut join_set = JoinSet::new();
        let mut unsettled = BTreeSet::new();

        for (ordinal, step) in group.steps.iter().enumerate() {
            let mut record = self.step_record(index, ordinal)?;
            if record.state == StepState::Success {
                debug!(task_id = %self.id(), step = %record.name, "Step already succeeded");
                continue;
            }
            record.transition(StepState::Running, None);
            self.persist_step(index, record.clone()).await?;

            let ctx = StepContext::new(
                self.id(),
                record.id,
                group.name.clone(),
                self.attempt(),
                self.cancel.clone(),
                self.settings.wait,
            );
            let step = Arc::clone(step);
            let semaphore = Arc::clone(&semaphore);
            unsettled.insert(ordinal);
            join_set.spawn(async move {
                let result: Result<()> = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::invariant_violation("step semaphore closed"))?;
                    ctx.check_cancelled()?;
                    AssertUnwindSafe(step.run(&ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(Error::step_failure(
                                step.name(),
                                format!("panicked: {}", panic_message(&*panic)),
                            ))
                        })
                }
                .await;
                (ordinal, result)
            });
        }

        let mut failures: Vec<(usize, Error)> = Vec::new();
        let mut lost = None;
        while let Some(joined) = join_set.join_next().await {
            let (ordinal, result) = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!(task_id = %self.id(), error = %join_error, "Step task did not complete");
                    lost = Some(join_error.to_string());
                    continue;
                }
            };
            unsettled.remove(&ordinal);

            let mut record = self.step_record(index, ordinal)?;
            match &result {
                Ok(()) => record.transition(StepState::Success, None),
                Err(e) if e.is_cancelled() => record.transition(StepState::Aborted, Some(e.to_string())),
                Err(e) => {
                    warn!(task_id = %self.id(), step = %record.name, error = %e, "Step failed");
                    record.transition(StepState::Failure, Some(e.to_string()));
                }
            }
            self.persist_step(index, record).await?;

            if let Err(e) = result {
                failures.push((ordinal, e));
            }
        }

        // Steps whose task died never reported back.
        for ordinal in unsettled {
            let mut record = self.step_record(index, ordinal)?;
            let error = Error::step_failure(
                record.name.clone(),
                format!(
                    "step task did not complete: {}",
                    lost.as_deref().unwrap_or("no result")
                ),
            );
            record.transition(StepState::Failure, Some(error.to_string()));
            self.persist_step(index, record).await?;
            failures.push((ordinal, error));
        }

        if failures.is_empty() {
            info!(
                task_id = %self.id(),
                group = %group.name,
                elapsed_ms = started.elapsed().as_millis(),
                "Subtask group completed"
            );
            return Ok(());
        }

        failures.sort_by_key(|(ordinal, _)| *ordinal);
        let chosen = if self.cancel.is_cancelled() {
            failures.iter().position(|(_, e)| e.is_cancelled())
        } else {
            failures.iter().position(|(_, e)| !e.is_cancelled())
        }
        .unwrap_or(0);
        Err(failures.swap_remove(chosen).1)
    }

    fn step_record(&self, index: usize, ordinal: usize) -> Result<StepRecord> {
        self.record
            .groups
            .get(index)
            .and_then(|g| g.steps.get(ordinal))
            .cloned()
            .ok_or_else(|| Error::not_found("step", format!("{}/{index}/{ordinal}", self.id())))
    }

    async fn persist_step(&mut self, index: usize, record: StepRecord) -> Result<()> {
        self.store.update_step(self.id(), index, &record).await?;
        if let Some(slot) = self
            .record
            .groups
            .get_mut(index)
            .and_then(|g| g.steps.get_mut(record.ordinal))
        {
            *slot = record;
        }
        Ok(())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::handler::fn_step;
    use crate::storage::InMemoryTaskStore;

    async fn runnable(store: &Arc<InMemoryTaskStore>) -> Result<RunnableTask> {
        let record = TaskRecord::new(TaskType::EditUniverse, json!({}), vec![]);
        store.create_task(&record).await?;
        let record = store.begin_attempt(record.id).await?;
        let store: Arc<dyn TaskStore> = Arc::clone(store) as Arc<dyn TaskStore>;
        Ok(RunnableTask::new(
            record,
            store,
            CancellationToken::new(),
            RunSettings::default(),
        ))
    }

    fn counting(name: &str, counter: &Arc<AtomicUsize>) -> Arc<dyn Step> {
        let counter = Arc::clone(counter);
        fn_step(name, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing(name: &str) -> Arc<dyn Step> {
        let owned = name.to_string();
        fn_step(name, move |_| {
            let name = owned.clone();
            async move { Err(Error::step_failure(name, "injected")) }
        })
    }

    #[tokio::test]
    async fn test_groups_run_in_order() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let counter = Arc::new(AtomicUsize::new(0));

        task.add_subtask_group(
            SubtaskGroup::new("first")
                .step(counting("a", &counter))
                .step(counting("b", &counter)),
        )
        .await?;
        task.add_subtask_group(SubtaskGroup::new("second").step(counting("c", &counter)))
            .await?;
        task.run_subtasks(false).await?;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        let record = store.load_task(task.id()).await?.ok_or_else(|| Error::not_found("task", ""))?;
        assert!(record.groups.iter().all(GroupRecord::succeeded));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_stops_later_groups() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let counter = Arc::new(AtomicUsize::new(0));

        task.add_subtask_group(SubtaskGroup::new("broken").step(failing("x"))).await?;
        task.add_subtask_group(SubtaskGroup::new("after").step(counting("c", &counter)))
            .await?;
        let result = task.run_subtasks(false).await;

        assert!(result.is_err_and(|e| e.is_step_failure()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_everything() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let counter = Arc::new(AtomicUsize::new(0));

        task.add_subtask_group(SubtaskGroup::new("broken").step(failing("x"))).await?;
        task.add_subtask_group(SubtaskGroup::new("after").step(counting("c", &counter)))
            .await?;
        let result = task.run_subtasks(true).await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_ignored_group_failure() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;

        task.add_subtask_group(SubtaskGroup::new("best-effort").step(failing("x")).ignore_errors())
            .await?;
        task.run_subtasks(false).await
    }

    /// Panics in `name()` once `run` has started, which escapes the step's
    /// unwind guard and kills its spawned task.
    struct NameBomb {
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Step for NameBomb {
        #[allow(clippy::panic)]
        fn name(&self) -> &str {
            if self.armed.load(Ordering::SeqCst) {
                panic!("name unavailable");
            }
            "bomb"
        }

        #[allow(clippy::panic)]
        async fn run(&self, _ctx: &StepContext) -> Result<()> {
            self.armed.store(true, Ordering::SeqCst);
            panic!("step exploded");
        }
    }

    #[tokio::test]
    async fn test_lost_step_task_fails_group_and_record() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let bomb: Arc<dyn Step> = Arc::new(NameBomb {
            armed: std::sync::atomic::AtomicBool::new(false),
        });

        task.add_subtask_group(SubtaskGroup::new("g").step(bomb)).await?;
        let result = task.run_subtasks(false).await;

        assert!(result.is_err_and(|e| e.is_step_failure()));
        let record = store
            .load_task(task.id())
            .await?
            .ok_or_else(|| Error::not_found("task", task.id().to_string()))?;
        let state = record.groups.first().and_then(|g| g.steps.first()).map(|s| s.state);
        assert_eq!(state, Some(StepState::Failure));
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_step_is_a_failure() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;

        #[allow(clippy::panic)]
        let step = fn_step("boom", |ctx: StepContext| async move {
            if ctx.attempt > 0 {
                panic!("kaboom");
            }
            Ok(())
        });
        task.add_subtask_group(SubtaskGroup::new("g").step(step)).await?;
        let result = task.run_subtasks(false).await;

        assert!(result.is_err_and(|e| e.to_string().contains("kaboom")));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_between_groups() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let counter = Arc::new(AtomicUsize::new(0));
        let token = task.cancellation().clone();

        let cancel_step = fn_step("cancel", move |_| {
            let token = token.clone();
            async move {
                token.cancel();
                Ok(())
            }
        });
        task.add_subtask_group(SubtaskGroup::new("first").step(cancel_step)).await?;
        task.add_subtask_group(SubtaskGroup::new("second").step(counting("c", &counter)))
            .await?;
        let result = task.run_subtasks(true).await;

        assert!(result.is_err_and(|e| e.is_cancelled()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_steps_of_a_group_run_concurrently() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut group = SubtaskGroup::new("pair");
        for name in ["left", "right"] {
            let barrier = Arc::clone(&barrier);
            group.add_step(fn_step(name, move |_| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            }));
        }
        task.add_subtask_group(group).await?;

        tokio::time::timeout(Duration::from_secs(5), task.run_subtasks(false))
            .await
            .map_err(|_| Error::external_timeout("barrier", 5000))?
    }

    #[tokio::test]
    async fn test_compensation_group_always_runs() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;
        let counter = Arc::new(AtomicUsize::new(0));

        task.add_subtask_group(SubtaskGroup::new("main").step(failing("x"))).await?;
        assert!(task.run_subtasks(false).await.is_err());

        for _ in 0..2 {
            task.add_compensation_group(
                SubtaskGroup::new("undo").step(counting("undo", &counter)).ignore_errors(),
            )
            .await?;
            task.run_subtasks(true).await?;
        }

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(task.record().groups.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_is_computed_once() -> Result<()> {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = runnable(&store).await?;

        let first: Vec<u32> = task.snapshot(|| async { Ok(vec![1, 2]) }).await?;
        let second: Vec<u32> = task.snapshot(|| async { Ok(vec![9]) }).await?;

        assert_eq!(first, second);
        Ok(())
    }
}
