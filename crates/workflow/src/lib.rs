//! Resumable task engine for cluster-mutation tasks.
//!
//! A task is an ordered list of subtask groups. Steps inside one group run
//! concurrently; groups run strictly in order. Key features:
//!
//! - **Durable progress**: every group append and step state change is
//!   written to a [`TaskStore`] before the next group starts.
//! - **Resumability**: a retried or resumed task re-runs its body, and
//!   groups that already succeeded are skipped.
//! - **Two-tier error handling**: [`TaskBody::run`] and
//!   [`TaskBody::compensate`] form the inner tier, [`TaskBody::cleanup`]
//!   the outer tier that always runs.
//! - **Per-type worker pools** with cooperative abort.
//!
//! # Example
//!
//! ```ignore
//! use conductor_workflow::{
//!     InMemoryTaskStore, NoOpStep, RunnableTask, SubtaskGroup, TaskBody, TaskExecutor,
//!     TaskRegistry,
//! };
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl TaskBody for Hello {
//!     async fn run(&mut self, task: &mut RunnableTask) -> conductor_core::Result<()> {
//!         task.add_subtask_group(SubtaskGroup::new("greet").step(Arc::new(NoOpStep::new("hi"))))
//!             .await?;
//!         task.run_subtasks(false).await
//!     }
//! }
//!
//! let mut registry = TaskRegistry::new();
//! registry.register(TaskType::EditUniverse, |_: &Value| Ok(Box::new(Hello) as Box<dyn TaskBody>));
//! let executor = TaskExecutor::new(Arc::new(InMemoryTaskStore::new()), registry, &config);
//! let id = executor.submit(TaskType::EditUniverse, json!({})).await?;
//! executor.wait_for_completion(id).await?;
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod engine;
pub mod handler;
pub mod storage;
pub mod task;
pub mod types;
pub mod wait;

// Re-export main types
pub use engine::{TaskBody, TaskExecutor, TaskFactory, TaskRegistry};
pub use handler::{FnStep, NoOpStep, Step, StepContext, fn_step};
pub use storage::{InMemoryTaskStore, TaskStore};
pub use task::{RunSettings, RunnableTask, SubtaskGroup};
pub use types::{
    GroupRecord, StepId, StepRecord, StepState, TaskId, TaskProgress, TaskRecord, TaskSnapshot,
    TaskStatus,
};
pub use wait::{Deadline, poll_until, wait_for};
