//! Core error types for Conductor operations.
//!
//! Every failure the engine can surface is an explicit, typed value. Callers
//! branch on the variant instead of parsing messages: `StaleVersion` and
//! `AlreadyLocked` are theirs to retry, `Cancelled` drives a different
//! compensation path than `StepFailure`, and `InvariantViolation` is never
//! retried.

use thiserror::Error;
use uuid::Uuid;

/// Core error type for Conductor operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Locking errors
    #[error("stale version for resource {resource}: expected {expected}, found {actual}")]
    StaleVersion {
        resource: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("resource {resource} is already being updated by another task")]
    AlreadyLocked { resource: Uuid },

    // Execution errors
    #[error("step '{step}' failed: {reason}")]
    StepFailure { step: String, reason: String },

    #[error("task cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("timed out after {timeout_ms}ms waiting for {condition}")]
    ExternalTimeout { condition: String, timeout_ms: u64 },

    #[error("invariant violated: {reason}")]
    InvariantViolation { reason: String },

    // Admission errors
    #[error("task {task_type} is not allowed while {entity} is in status {status}")]
    TaskNotAllowed {
        task_type: String,
        entity: String,
        status: String,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    // Infrastructure errors
    #[error("storage operation '{operation}' failed: {reason}")]
    StorageFailed { operation: String, reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl Error {
    /// Create a stale version error.
    pub fn stale_version(resource: Uuid, expected: u64, actual: u64) -> Self {
        Self::StaleVersion {
            resource,
            expected,
            actual,
        }
    }

    /// Create an already locked error.
    pub fn already_locked(resource: Uuid) -> Self {
        Self::AlreadyLocked { resource }
    }

    /// Create a step failure error.
    pub fn step_failure(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepFailure {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an external timeout error.
    pub fn external_timeout(condition: impl Into<String>, timeout_ms: u64) -> Self {
        Self::ExternalTimeout {
            condition: condition.into(),
            timeout_ms,
        }
    }

    /// Create an invariant violation error.
    pub fn invariant_violation(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// Create a task not allowed error.
    pub fn task_not_allowed(
        task_type: impl Into<String>,
        entity: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self::TaskNotAllowed {
            task_type: task_type.into(),
            entity: entity.into(),
            status: status.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a storage failed error.
    pub fn storage_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether this error came from cooperative cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the caller (not the engine) should re-fetch and resubmit.
    #[must_use]
    pub const fn is_caller_retryable(&self) -> bool {
        matches!(self, Self::StaleVersion { .. } | Self::AlreadyLocked { .. })
    }

    /// Whether this error counts as a step failure. Timeouts are step
    /// failures carrying their own tag.
    #[must_use]
    pub const fn is_step_failure(&self) -> bool {
        matches!(self, Self::StepFailure { .. } | Self::ExternalTimeout { .. })
    }

    /// Whether this error is fatal to any retry of the same plan.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }

    /// Short tag for structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StaleVersion { .. } => "stale_version",
            Self::AlreadyLocked { .. } => "already_locked",
            Self::StepFailure { .. } => "step_failure",
            Self::Cancelled { .. } => "cancelled",
            Self::ExternalTimeout { .. } => "external_timeout",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::TaskNotAllowed { .. } => "task_not_allowed",
            Self::NotFound { .. } => "not_found",
            Self::StorageFailed { .. } => "storage_failed",
            Self::Serialization { .. } => "serialization",
            Self::Config { .. } => "config",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
