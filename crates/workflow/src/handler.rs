//! Step trait and implementations.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{Error, Result, WaitConfig};
use tokio_util::sync::CancellationToken;

use crate::types::{StepId, TaskId};
use crate::wait;

/// One unit of work inside a subtask group.
///
/// Steps of the same group may run concurrently, so a step must not depend
/// on a sibling's side effects. A step that waits on an external condition
/// should do so through [`StepContext::wait_for`] so the wait is bounded and
/// observes abort requests.
#[async_trait]
pub trait Step: Send + Sync {
    /// Step name (for logs and the durable record).
    fn name(&self) -> &str;

    /// Execute the step.
    async fn run(&self, ctx: &StepContext) -> Result<()>;
}

/// Execution context handed to a running step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Owning task.
    pub task_id: TaskId,
    /// This step.
    pub step_id: StepId,
    /// Name of the enclosing group.
    pub group: String,
    /// Attempt number of the owning task (1-based).
    pub attempt: u32,
    cancel: CancellationToken,
    wait: WaitConfig,
}

impl StepContext {
    /// Create a step context.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        step_id: StepId,
        group: impl Into<String>,
        attempt: u32,
        cancel: CancellationToken,
        wait: WaitConfig,
    ) -> Self {
        Self {
            task_id,
            step_id,
            group: group.into(),
            attempt,
            cancel,
            wait,
        }
    }

    /// Check if the owning task was asked to abort.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Cancelled` if the owning task was asked to abort.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::cancelled(format!("task {} aborted", self.task_id)));
        }
        Ok(())
    }

    /// Cancellation token of the owning task.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Configured wait parameters.
    #[must_use]
    pub const fn wait_config(&self) -> WaitConfig {
        self.wait
    }

    /// Bounded, abortable wait on an external condition.
    pub async fn wait_for<F, Fut>(&self, condition: &str, check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        wait::wait_for(condition, self.wait, &self.cancel, check).await
    }
}

/// A step that does nothing. Useful as a group marker and in tests.
pub struct NoOpStep {
    name: String,
}

impl NoOpStep {
    /// Create a new no-op step with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Step for NoOpStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

/// A step that delegates to an async function.
pub struct FnStep<F, Fut>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    name: String,
    func: F,
}

impl<F, Fut> FnStep<F, Fut>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    /// Create a new function step.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F, Fut>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        (self.func)(ctx.clone()).await
    }
}

/// Build a shared step from an async closure.
pub fn fn_step<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn Step>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnStep::new(name, func))
}
