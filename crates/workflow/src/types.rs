//! Core types for the task engine.
//!
//! These are the durable records: what the task store persists and what a
//! restarted process reads back to decide which groups already ran.

use chrono::{DateTime, Utc};
use conductor_core::TaskType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new random task ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(Uuid);

impl StepId {
    /// Create a new random step ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Submitted, waiting for a pool slot.
    Created,
    /// An attempt is executing (or was, when the process died).
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Cancelled by an abort request.
    Aborted,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }

    /// Check if the task can transition to the given status.
    ///
    /// `Running -> Running` is a resumed attempt after a restart;
    /// `Failure/Aborted -> Running` is an explicit retry.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        use TaskStatus::{Aborted, Created, Failure, Running, Success};
        matches!(
            (self, target),
            (Created | Running | Failure | Aborted, Running)
                | (Created | Running | Failure, Aborted)
                | (Running, Success | Failure)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Step state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
}

impl StepState {
    /// Check if the step is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }
}

/// Durable record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Unique step identifier.
    pub id: StepId,
    /// Step name, as reported by the step.
    pub name: String,
    /// Position inside the parent group.
    pub ordinal: usize,
    /// Current state.
    pub state: StepState,
    /// Error message of the last failed run.
    pub error: Option<String>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    /// Create a pending step record.
    pub fn pending(name: impl Into<String>, ordinal: usize) -> Self {
        Self {
            id: StepId::new(),
            name: name.into(),
            ordinal,
            state: StepState::Pending,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to a new state.
    pub fn transition(&mut self, state: StepState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.updated_at = Utc::now();
    }
}

/// Durable record of one subtask group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Position inside the task (append order).
    pub index: usize,
    /// Group name.
    pub name: String,
    /// Whether a failure of this group is logged and ignored.
    pub ignore_errors: bool,
    /// Appended by failure compensation rather than by the task plan.
    #[serde(default)]
    pub compensation: bool,
    /// Steps of the group.
    pub steps: Vec<StepRecord>,
    /// Timestamp the group was appended.
    pub created_at: DateTime<Utc>,
}

impl GroupRecord {
    /// Check whether every step is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_terminal())
    }

    /// Check whether every step succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.state == StepState::Success)
    }
}

/// Task parameters frozen at first-attempt time.
///
/// Retries load this instead of recomputing the plan from live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Serialized plan.
    pub params: serde_json::Value,
    /// Timestamp the snapshot was written.
    pub created_at: DateTime<Utc>,
}

impl TaskSnapshot {
    /// Create a snapshot of the given plan.
    #[must_use]
    pub fn new(params: serde_json::Value) -> Self {
        Self {
            params,
            created_at: Utc::now(),
        }
    }
}

/// Durable record of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier.
    pub id: TaskId,
    /// Task type tag.
    pub task_type: TaskType,
    /// Caller parameters as submitted.
    pub params: serde_json::Value,
    /// Resources the task mutates.
    pub resources: Vec<Uuid>,
    /// Current status.
    pub status: TaskStatus,
    /// Number of attempts started so far.
    pub attempt: u32,
    /// Groups in append order.
    pub groups: Vec<GroupRecord>,
    /// Plan frozen at the first attempt.
    pub snapshot: Option<TaskSnapshot>,
    /// Error message of the last failed attempt.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new task record in `Created` status.
    #[must_use]
    pub fn new(task_type: TaskType, params: serde_json::Value, resources: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type,
            params,
            resources,
            status: TaskStatus::Created,
            attempt: 0,
            groups: Vec::new(),
            snapshot: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Percentage of recorded steps that succeeded (0.0 to 100.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_complete(&self) -> f64 {
        if self.status == TaskStatus::Success {
            return 100.0;
        }
        let (done, total) = self
            .groups
            .iter()
            .flat_map(|g| g.steps.iter())
            .fold((0usize, 0usize), |(done, total), s| {
                (done + usize::from(s.state == StepState::Success), total + 1)
            });
        if total == 0 {
            return 0.0;
        }
        done as f64 * 100.0 / total as f64
    }

    /// Caller-facing progress view.
    #[must_use]
    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            task_id: self.id,
            task_type: self.task_type,
            status: self.status,
            percent_complete: self.percent_complete(),
            error_message: self.error.clone(),
        }
    }
}

/// What a caller sees when polling a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub percent_complete: f64,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(index: usize, states: &[StepState]) -> GroupRecord {
        GroupRecord {
            index,
            name: format!("group-{index}"),
            ignore_errors: false,
            compensation: false,
            steps: states
                .iter()
                .enumerate()
                .map(|(i, state)| {
                    let mut step = StepRecord::pending(format!("step-{i}"), i);
                    step.transition(*state, None);
                    step
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Failure.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Aborted));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Created.can_transition_to(TaskStatus::Success));
    }

    #[test]
    fn test_group_completion() {
        assert!(group(0, &[StepState::Success, StepState::Failure]).is_complete());
        assert!(!group(0, &[StepState::Success, StepState::Running]).is_complete());
        assert!(!group(0, &[StepState::Success, StepState::Failure]).succeeded());
        assert!(group(0, &[StepState::Success, StepState::Success]).succeeded());
    }

    #[test]
    fn test_percent_complete() {
        let mut record = TaskRecord::new(TaskType::EditUniverse, serde_json::Value::Null, vec![]);
        assert!((record.percent_complete() - 0.0).abs() < f64::EPSILON);

        record.groups.push(group(0, &[StepState::Success, StepState::Success]));
        record.groups.push(group(1, &[StepState::Pending, StepState::Pending]));
        assert!((record.percent_complete() - 50.0).abs() < f64::EPSILON);

        record.status = TaskStatus::Success;
        assert!((record.percent_complete() - 100.0).abs() < f64::EPSILON);
    }
}
