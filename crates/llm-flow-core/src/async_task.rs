// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async step runtime types: task state, progress reporting, and the
//! background task contract.
//!
//! A step returning `StepResult::Async` names a task registered on the
//! engine. Each dispatch mints a fresh message id and persists an
//! [`AsyncStepState`] row that the single owning worker mutates until the
//! task reaches a terminal status. Timeout enforcement and the completion
//! feedback into the scheduler live in the scheduler module; this module
//! owns the data model and the worker-facing API.

use crate::error::Result;
use crate::step::{CancelFlag, StepResult};
use crate::store::AsyncStateStoreRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl AsyncTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AsyncTaskStatus::Completed
                | AsyncTaskStatus::Failed
                | AsyncTaskStatus::Cancelled
                | AsyncTaskStatus::TimedOut
        )
    }
}

/// Durable state of one async task execution, keyed by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncStepState {
    pub message_id: String,
    pub instance_id: String,
    pub step_id: String,
    pub status: AsyncTaskStatus,
    pub progress_percent: u8,
    pub status_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Step result produced on completion.
    pub result: Option<StepResult>,
    /// Failure diagnostic on FAILED or TIMED_OUT.
    pub error: Option<String>,
}

impl AsyncStepState {
    pub fn pending(
        message_id: impl Into<String>,
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            status: AsyncTaskStatus::Pending,
            progress_percent: 0,
            status_message: None,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
        }
    }

    /// Timestamp retention sweeps compare against.
    pub fn retention_timestamp(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }
}

/// Progress channel handed to a running task.
///
/// Updates flow straight to the async state store from the single worker
/// owning the task, so readers observe them in arrival order.
#[derive(Clone)]
pub struct ProgressReporter {
    message_id: String,
    store: AsyncStateStoreRef,
}

impl ProgressReporter {
    pub(crate) fn new(message_id: impl Into<String>, store: AsyncStateStoreRef) -> Self {
        Self {
            message_id: message_id.into(),
            store,
        }
    }

    /// Publishes progress. Percent is clamped to 100; lowering a previously
    /// reported value is allowed and passed through as-is.
    pub async fn update(&self, percent: u8, message: impl Into<String>) -> Result<()> {
        let percent = percent.min(100);
        let message = message.into();
        tracing::debug!(
            message_id = %self.message_id,
            percent,
            status = %message,
            "async task progress"
        );
        self.store
            .update_progress(&self.message_id, percent, Some(message))
            .await?;
        Ok(())
    }
}

/// Execution context handed to a background task.
pub struct AsyncTaskContext {
    pub message_id: String,
    pub instance_id: String,
    pub step_id: String,
    pub progress: ProgressReporter,
    cancel: CancelFlag,
}

impl AsyncTaskContext {
    pub(crate) fn new(
        message_id: impl Into<String>,
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            progress,
            cancel,
        }
    }

    /// Whether cancellation has been requested; tasks must observe this and
    /// terminate promptly.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A background task runnable by the async step runtime.
///
/// The returned [`StepResult`] is fed back into the reducer for the
/// originating step; its payload must match the step's declared wrapped
/// output type.
#[async_trait]
pub trait AsyncTask: Send + Sync {
    async fn run(&self, args: HashMap<String, Value>, ctx: AsyncTaskContext) -> Result<StepResult>;
}

/// Helper building the `Fail` result fed back after a timeout.
pub(crate) fn timeout_result(timeout_ms: u64) -> StepResult {
    StepResult::Fail {
        error: crate::step::StepFailure::timeout(format!(
            "async task exceeded its deadline of {}ms",
            timeout_ms
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAsyncStateStore;
    use crate::store::AsyncStateStore;
    use std::sync::Arc;

    #[test]
    fn test_terminal_statuses() {
        assert!(AsyncTaskStatus::Completed.is_terminal());
        assert!(AsyncTaskStatus::TimedOut.is_terminal());
        assert!(!AsyncTaskStatus::Pending.is_terminal());
        assert!(!AsyncTaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_retention_timestamp_prefers_end_time() {
        let mut state = AsyncStepState::pending("m1", "i1", "s1");
        assert_eq!(state.retention_timestamp(), state.start_time);
        let end = Utc::now();
        state.end_time = Some(end);
        assert_eq!(state.retention_timestamp(), end);
    }

    #[tokio::test]
    async fn test_progress_reporter_clamps() {
        let store: AsyncStateStoreRef = Arc::new(MemoryAsyncStateStore::new());
        store
            .save(&AsyncStepState::pending("m1", "i1", "s1"))
            .await
            .unwrap();

        let reporter = ProgressReporter::new("m1", store.clone());
        reporter.update(250, "overshoot").await.unwrap();

        let state = store.get("m1").await.unwrap().unwrap();
        assert_eq!(state.progress_percent, 100);
        assert_eq!(state.status_message.as_deref(), Some("overshoot"));
    }

    #[test]
    fn test_timeout_result_shape() {
        let result = timeout_result(60_000);
        match result {
            StepResult::Fail { error } => {
                assert_eq!(error.kind, crate::error::ErrorKind::Timeout);
                assert!(!error.retryable);
                assert!(error.message.contains("60000ms"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
