// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow instances: the durable per-run record the scheduler drives.

use crate::context::WorkflowContext;
use crate::schema::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    New,
    Running,
    Suspended,
    AwaitingAsync,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses are frozen; no further mutation is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Whether `cancel` may transition this status to CANCELLED.
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InstanceStatus::New => "NEW",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::AwaitingAsync => "AWAITING_ASYNC",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Cancelled => "CANCELLED",
        };
        f.write_str(text)
    }
}

/// Retry bookkeeping for one (instance, step) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A running or completed execution of a workflow, keyed by instance id
/// (the chat/session id for conversational callers).
///
/// Mutated only by the single scheduler fiber currently holding the
/// instance; every save bumps `revision` for optimistic conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub workflow_id: String,
    pub version: String,
    pub status: InstanceStatus,
    pub current_step_id: String,
    /// Input pending for `current_step_id`, when one is staged.
    pub current_input: Option<Payload>,
    /// Message id of the in-flight async task, while AWAITING_ASYNC.
    pub active_message_id: Option<String>,
    pub context: WorkflowContext,
    pub retry_state: HashMap<String, RetryState>,
    pub invocation_counts: HashMap<String, u32>,
    pub last_error: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        instance_id: impl Into<String>,
        workflow_id: impl Into<String>,
        version: impl Into<String>,
        initial_step_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            workflow_id: workflow_id.into(),
            version: version.into(),
            status: InstanceStatus::New,
            current_step_id: initial_step_id.into(),
            current_input: None,
            active_message_id: None,
            context: WorkflowContext::new(),
            retry_state: HashMap::new(),
            invocation_counts: HashMap::new(),
            last_error: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bumps the revision and refreshes `updated_at`; called once per save.
    pub fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    /// Retry bookkeeping for a step, created lazily.
    pub fn retry_state_mut(&mut self, step_id: &str) -> &mut RetryState {
        self.retry_state.entry(step_id.to_string()).or_default()
    }

    /// Clears retry bookkeeping after a successful attempt so later
    /// invocations of the same step start a fresh budget.
    pub fn clear_retry_state(&mut self, step_id: &str) {
        self.retry_state.remove(step_id);
    }

    /// Counts a step beginning execution and returns the new total.
    /// Retries of a failed attempt do not pass through here.
    pub fn record_invocation(&mut self, step_id: &str) -> u32 {
        let count = self.invocation_counts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn invocation_count(&self, step_id: &str) -> u32 {
        self.invocation_counts.get(step_id).copied().unwrap_or(0)
    }
}

/// Read-only status report for external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub current_step_id: String,
    /// Progress of the in-flight async task, while AWAITING_ASYNC.
    pub progress_percent: Option<u8>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
        assert!(!InstanceStatus::AwaitingAsync.is_terminal());
    }

    #[test]
    fn test_revision_bumps_on_touch() {
        let mut instance = WorkflowInstance::new("chat-1", "wf", "1.0", "start");
        assert_eq!(instance.revision, 0);
        instance.touch();
        instance.touch();
        assert_eq!(instance.revision, 2);
        assert!(instance.updated_at >= instance.created_at);
    }

    #[test]
    fn test_invocation_counter() {
        let mut instance = WorkflowInstance::new("chat-1", "wf", "1.0", "start");
        assert_eq!(instance.invocation_count("loop"), 0);
        assert_eq!(instance.record_invocation("loop"), 1);
        assert_eq!(instance.record_invocation("loop"), 2);
        assert_eq!(instance.invocation_count("loop"), 2);
    }

    #[test]
    fn test_retry_state_lifecycle() {
        let mut instance = WorkflowInstance::new("chat-1", "wf", "1.0", "start");
        {
            let rs = instance.retry_state_mut("flaky");
            rs.attempts = 2;
            rs.last_error = Some("boom".to_string());
        }
        assert_eq!(instance.retry_state["flaky"].attempts, 2);
        instance.clear_retry_state("flaky");
        assert!(instance.retry_state.get("flaky").is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut instance = WorkflowInstance::new("chat-1", "wf", "1.0", "start");
        instance.record_invocation("start");
        instance.touch();

        let encoded = serde_json::to_string(&instance).unwrap();
        let decoded: WorkflowInstance = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.instance_id, "chat-1");
        assert_eq!(decoded.revision, 1);
        assert_eq!(decoded.invocation_count("start"), 1);
    }
}
