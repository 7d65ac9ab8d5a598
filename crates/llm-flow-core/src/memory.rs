// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference in-memory store implementations.
//!
//! Backed by concurrent maps; suitable for tests, examples, and embedded
//! single-process deployments. Durability across restarts comes from the
//! adapters in `llm-flow-state` or external database adapters.

use crate::async_task::{AsyncStepState, AsyncTaskStatus};
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::store::{
    AsyncStateStore, InstanceStore, Result, StoreError, SuspensionStore,
};
use crate::suspend::Suspension;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// In-memory [`InstanceStore`] with optimistic revision checking.
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    inner: DashMap<String, WorkflowInstance>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        Ok(self.inner.get(instance_id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        if let Some(existing) = self.inner.get(&instance.instance_id) {
            if existing.revision >= instance.revision {
                return Err(StoreError::RevisionConflict {
                    key: instance.instance_id.clone(),
                    stored: existing.revision,
                    incoming: instance.revision,
                });
            }
        }
        self.inner
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        Ok(self.inner.remove(instance_id).is_some())
    }

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .inner
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// In-memory [`AsyncStateStore`].
#[derive(Debug, Default)]
pub struct MemoryAsyncStateStore {
    inner: DashMap<String, AsyncStepState>,
}

impl MemoryAsyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AsyncStateStore for MemoryAsyncStateStore {
    async fn save(&self, state: &AsyncStepState) -> Result<()> {
        self.inner.insert(state.message_id.clone(), state.clone());
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<AsyncStepState>> {
        Ok(self.inner.get(message_id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, message_id: &str) -> Result<bool> {
        Ok(self.inner.remove(message_id).is_some())
    }

    async fn update_progress(
        &self,
        message_id: &str,
        percent: u8,
        message: Option<String>,
    ) -> Result<()> {
        match self.inner.get_mut(message_id) {
            Some(mut entry) => {
                entry.progress_percent = percent;
                if message.is_some() {
                    entry.status_message = message;
                }
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "no async state for message `{}`",
                message_id
            ))),
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let stale: Vec<String> = self
            .inner
            .iter()
            .filter(|entry| entry.retention_timestamp() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        let mut deleted = 0;
        for key in stale {
            if self.inner.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// In-memory [`SuspensionStore`].
#[derive(Debug, Default)]
pub struct MemorySuspensionStore {
    inner: DashMap<String, Suspension>,
}

impl MemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuspensionStore for MemorySuspensionStore {
    async fn save(&self, suspension: &Suspension) -> Result<()> {
        self.inner
            .insert(suspension.instance_id.clone(), suspension.clone());
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Option<Suspension>> {
        Ok(self.inner.get(instance_id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        Ok(self.inner.remove(instance_id).is_some())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let stale: Vec<String> = self
            .inner
            .iter()
            .filter(|entry| entry.created_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        let mut deleted = 0;
        for key in stale {
            if self.inner.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Marks an async state row terminal if it is not already; returns whether
/// the write happened. Used by workers and cancellation so exactly one
/// terminal status wins per message id.
pub(crate) async fn finish_async_state(
    store: &crate::store::AsyncStateStoreRef,
    message_id: &str,
    status: AsyncTaskStatus,
    result: Option<crate::step::StepResult>,
    error: Option<String>,
) -> Result<bool> {
    let mut state = match store.get(message_id).await? {
        Some(state) => state,
        None => return Ok(false),
    };
    if state.status.is_terminal() {
        return Ok(false);
    }
    state.status = status;
    state.end_time = Some(Utc::now());
    state.result = result;
    state.error = error;
    if status == AsyncTaskStatus::Completed {
        state.progress_percent = 100;
    }
    store.save(&state).await?;
    Ok(true)
}
