// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence contracts.
//!
//! Three pluggable stores make the engine durable: instances, async task
//! state, and suspension records. All operations are idempotent on their
//! key; instance saves are optimistic on the record's monotonic revision.
//! Reference in-memory implementations live in [`crate::memory`]; external
//! adapters (document databases, the file adapters of `llm-flow-state`)
//! plug in through the same traits.

use crate::async_task::AsyncStepState;
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::suspend::Suspension;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encode/decode error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic concurrency violation
    #[error("revision conflict for `{key}`: stored {stored}, incoming {incoming}")]
    RevisionConflict {
        key: String,
        stored: u64,
        incoming: u64,
    },

    /// Backend-specific error
    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage for workflow instances, keyed by instance id.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, instance_id: &str) -> Result<Option<WorkflowInstance>>;

    /// Saves the instance. Implementations reject saves whose revision is
    /// not strictly greater than the stored one.
    async fn save(&self, instance: &WorkflowInstance) -> Result<()>;

    /// Removes the instance; returns whether it existed.
    async fn delete(&self, instance_id: &str) -> Result<bool>;

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>>;
}

/// Durable storage for async task state, keyed by message id.
#[async_trait]
pub trait AsyncStateStore: Send + Sync {
    async fn save(&self, state: &AsyncStepState) -> Result<()>;

    async fn get(&self, message_id: &str) -> Result<Option<AsyncStepState>>;

    /// Removes the record; returns whether it existed.
    async fn delete(&self, message_id: &str) -> Result<bool>;

    /// Applies a progress update in arrival order for the message id.
    async fn update_progress(
        &self,
        message_id: &str,
        percent: u8,
        message: Option<String>,
    ) -> Result<()>;

    /// Deletes records finished (or, lacking an end time, started) before
    /// the cutoff. Returns the number deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Durable storage for suspension records, keyed by instance id.
#[async_trait]
pub trait SuspensionStore: Send + Sync {
    async fn save(&self, suspension: &Suspension) -> Result<()>;

    async fn get(&self, instance_id: &str) -> Result<Option<Suspension>>;

    /// Removes the record; returns whether it existed.
    async fn delete(&self, instance_id: &str) -> Result<bool>;

    /// Deletes suspensions created before the cutoff. Returns the number
    /// deleted. Sweeping suspensions is opt-in at the engine level.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Type alias for Arc-wrapped InstanceStore
pub type InstanceStoreRef = Arc<dyn InstanceStore>;

/// Type alias for Arc-wrapped AsyncStateStore
pub type AsyncStateStoreRef = Arc<dyn AsyncStateStore>;

/// Type alias for Arc-wrapped SuspensionStore
pub type SuspensionStoreRef = Arc<dyn SuspensionStore>;
