use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EntityKind;

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;

/// Errors raised by the state machines, the work queue and the orchestrators.
///
/// Every variant carries only owned, serializable data so that a failure can be
/// marshalled into a job record and re-raised on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OrchestrationError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{kind} {id} not found")]
    EntityNotFound { kind: EntityKind, id: u64 },

    #[error("{kind} {id} is in state {state}, which does not allow {operation}")]
    IllegalState {
        kind: EntityKind,
        id: u64,
        state: String,
        operation: String,
    },

    #[error("concurrent operation: {0}")]
    ConcurrentOperation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("no transition registered in {machine} for state {state} on event {event}")]
    NoTransition {
        machine: String,
        state: String,
        event: String,
    },

    #[error("operation failed: {0}")]
    Execution(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

/// Coarse taxonomy used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input, missing entity, disallowed state. Never retried.
    Validation,
    /// Another operation holds the resource. The caller may retry later.
    Concurrency,
    /// The job body failed after dispatch.
    Execution,
    /// Programming or configuration error, or anything else.
    Unexpected,
}

impl OrchestrationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidParameter(_)
            | Self::EntityNotFound { .. }
            | Self::IllegalState { .. }
            | Self::PermissionDenied(_)
            | Self::Unsupported(_)
            | Self::ResourceLimitExceeded(_) => ErrorCategory::Validation,
            Self::ConcurrentOperation(_) => ErrorCategory::Concurrency,
            Self::Execution(_) | Self::Timeout(_) => ErrorCategory::Execution,
            Self::NoTransition { .. } | Self::Unexpected(_) => ErrorCategory::Unexpected,
        }
    }

    /// Domain failures are re-raised as-is; everything else gets wrapped.
    pub fn failure_kind(&self) -> FailureKind {
        match self.category() {
            ErrorCategory::Unexpected => FailureKind::System,
            _ => FailureKind::Business,
        }
    }

    pub fn is_concurrency(&self) -> bool {
        self.category() == ErrorCategory::Concurrency
    }
}

/// Distinguishes domain failures from infrastructure or programming failures
/// when a job result is marshalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Recoverable domain failure (validation, concurrency, execution).
    Business,
    /// Unexpected failure (panic, missing transition, lost job record).
    System,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}

/// A failure recorded on a job, as stored by the job storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub error: Option<OrchestrationError>,
}

impl JobFailure {
    /// A failure with no structured error, e.g. a panic inside the job body.
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::System,
            message: message.into(),
            error: None,
        }
    }

    /// Rebuild the error the caller sees once the job is done.
    pub fn into_error(self, job_id: &str) -> OrchestrationError {
        match (self.kind, self.error) {
            (FailureKind::Business, Some(error)) => error,
            (FailureKind::Business, None) => OrchestrationError::Execution(self.message),
            (FailureKind::System, _) => {
                OrchestrationError::Unexpected(format!("job {job_id} failed: {}", self.message))
            }
        }
    }
}

impl From<OrchestrationError> for JobFailure {
    fn from(error: OrchestrationError) -> Self {
        Self {
            kind: error.failure_kind(),
            message: error.to_string(),
            error: Some(error),
        }
    }
}
