// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine error types.

use crate::instance::InstanceStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse classification of an engine error.
///
/// Retry policies filter on these kinds, and `StepResult::Fail` carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidGraph,
    NoNext,
    AmbiguousNext,
    TypeMismatch,
    IllegalState,
    NotSuspended,
    Busy,
    InvocationLimitExceeded,
    Timeout,
    StepError,
    Cancelled,
    Store,
    Serialization,
}

impl ErrorKind {
    /// Stable string form used in logs and persisted diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidGraph => "INVALID_GRAPH",
            ErrorKind::NoNext => "NO_NEXT",
            ErrorKind::AmbiguousNext => "AMBIGUOUS_NEXT",
            ErrorKind::TypeMismatch => "TYPE_MISMATCH",
            ErrorKind::IllegalState => "ILLEGAL_STATE",
            ErrorKind::NotSuspended => "NOT_SUSPENDED",
            ErrorKind::Busy => "BUSY",
            ErrorKind::InvocationLimitExceeded => "INVOCATION_LIMIT_EXCEEDED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::StepError => "STEP_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Store => "STORE",
            ErrorKind::Serialization => "SERIALIZATION",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for all engine operations.
///
/// Every variant carries string diagnostics only, so terminal errors can be
/// cloned and broadcast to every handle observing an instance.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Registration-time structural violation(s).
    #[error("invalid workflow graph `{workflow_id}`: {}", .violations.join("; "))]
    InvalidGraph {
        workflow_id: String,
        violations: Vec<String>,
    },

    /// A single step descriptor is malformed.
    #[error("invalid step `{step_id}`: {reason}")]
    InvalidStepConfig { step_id: String, reason: String },

    /// Workflow id already registered.
    #[error("workflow `{workflow_id}` is already registered")]
    WorkflowExists { workflow_id: String },

    /// Workflow id not registered.
    #[error("workflow `{workflow_id}` is not registered")]
    WorkflowNotFound { workflow_id: String },

    /// Instance id already in use.
    #[error("instance `{instance_id}` already exists")]
    InstanceExists { instance_id: String },

    /// Instance id unknown.
    #[error("instance `{instance_id}` not found")]
    InstanceNotFound { instance_id: String },

    /// The reducer found no successor accepting the produced payload.
    #[error("no next step after `{step_id}` accepts `{schema}`")]
    NoNext { step_id: String, schema: String },

    /// The reducer found several equally preferable successors.
    #[error("ambiguous next step after `{step_id}` for `{schema}`: {candidates:?}")]
    AmbiguousNext {
        step_id: String,
        schema: String,
        candidates: Vec<String>,
    },

    /// Input incompatible with the expected schema.
    #[error("type mismatch: expected `{expected}`, got `{actual}`")]
    TypeMismatch { expected: String, actual: String },

    /// Operation invalid for the instance's current status.
    #[error("instance `{instance_id}` is {status}, cannot {operation}")]
    IllegalState {
        instance_id: String,
        status: InstanceStatus,
        operation: String,
    },

    /// No suspension is awaiting input for this instance.
    #[error("instance `{instance_id}` has no awaiting suspension")]
    NotSuspended { instance_id: String },

    /// Concurrent access to the same instance.
    #[error("instance `{instance_id}` is busy")]
    Busy { instance_id: String },

    /// Step invocation budget exhausted.
    #[error("step `{step_id}` exceeded its invocation limit of {limit}")]
    InvocationLimitExceeded { step_id: String, limit: u32 },

    /// Async task exceeded its deadline.
    #[error("step `{step_id}` timed out: {detail}")]
    Timeout { step_id: String, detail: String },

    /// Wrapped user-code failure.
    #[error("step `{step_id}` failed: {message}")]
    StepError {
        step_id: String,
        message: String,
        retryable: bool,
    },

    /// Async result names a task no one registered.
    #[error("async task `{task_id}` is not registered")]
    UnknownTask { task_id: String },

    /// Instance was cancelled.
    #[error("instance `{instance_id}` was cancelled")]
    Cancelled { instance_id: String },

    /// Engine no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Persistence adapter failure.
    #[error("store error: {detail}")]
    Store { detail: String },

    /// Payload encode/decode failure.
    #[error("serialization error: {detail}")]
    Serialization { detail: String },
}

impl EngineError {
    /// Builds a retryable step error wrapping user code failure detail.
    pub fn step_error(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::StepError {
            step_id: step_id.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Classifies this error for retry filtering and reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidGraph { .. }
            | EngineError::InvalidStepConfig { .. }
            | EngineError::WorkflowExists { .. }
            | EngineError::WorkflowNotFound { .. } => ErrorKind::InvalidGraph,
            EngineError::InstanceExists { .. } | EngineError::IllegalState { .. } => {
                ErrorKind::IllegalState
            }
            EngineError::InstanceNotFound { .. } | EngineError::ShuttingDown => {
                ErrorKind::IllegalState
            }
            EngineError::NoNext { .. } => ErrorKind::NoNext,
            EngineError::AmbiguousNext { .. } => ErrorKind::AmbiguousNext,
            EngineError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            EngineError::NotSuspended { .. } => ErrorKind::NotSuspended,
            EngineError::Busy { .. } => ErrorKind::Busy,
            EngineError::InvocationLimitExceeded { .. } => ErrorKind::InvocationLimitExceeded,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::StepError { .. } | EngineError::UnknownTask { .. } => ErrorKind::StepError,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::Store { .. } => ErrorKind::Store,
            EngineError::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    /// Whether the retry engine may re-attempt the failed step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StepError { retryable: true, .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization {
            detail: err.to_string(),
        }
    }
}

impl From<crate::store::StoreError> for EngineError {
    fn from(err: crate::store::StoreError) -> Self {
        EngineError::Store {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = EngineError::NoNext {
            step_id: "a".to_string(),
            schema: "Foo".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NoNext);

        let err = EngineError::step_error("a", "boom");
        assert_eq!(err.kind(), ErrorKind::StepError);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_not_retryable() {
        let err = EngineError::Timeout {
            step_id: "a".to_string(),
            detail: "deadline of 60000ms exceeded".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_graph_display() {
        let err = EngineError::InvalidGraph {
            workflow_id: "wf".to_string(),
            violations: vec![
                "multiple_initial: `a`, `b`".to_string(),
                "unknown_step: `c` -> `missing`".to_string(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("multiple_initial"));
        assert!(text.contains("unknown_step"));
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::NoNext.as_str(), "NO_NEXT");
        assert_eq!(ErrorKind::Busy.to_string(), "BUSY");
    }
}
