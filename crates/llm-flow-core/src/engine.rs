// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The workflow engine: registration, the public driving API, and the
//! shared runtime state every scheduler fiber works against.
//!
//! The engine is explicitly constructed via [`EngineBuilder`] and passed to
//! callers; there is no process-wide registry. It owns a bounded worker
//! pool, the per-instance locks that serialize scheduling turns, and the
//! completion channels behind [`Handle`].

use crate::async_task::AsyncTask;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{GraphBuilder, WorkflowGraph};
use crate::instance::{InstanceStatus, StatusSnapshot, WorkflowInstance};
use crate::interceptor::{ExecutionInterceptor, InterceptorChain};
use crate::memory::{MemoryAsyncStateStore, MemoryInstanceStore, MemorySuspensionStore};
use crate::metrics;
use crate::schema::{ExecutionInput, Payload, SchemaRegistry};
use crate::scheduler::TurnEntry;
use crate::step::{CancelFlag, StepResult};
use crate::store::{
    AsyncStateStore, AsyncStateStoreRef, InstanceStore, InstanceStoreRef, SuspensionStore,
    SuspensionStoreRef,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Terminal outcome broadcast to every handle of an instance.
pub type TerminalOutcome = std::result::Result<Payload, EngineError>;

pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) schemas: Arc<SchemaRegistry>,
    pub(crate) workflows: DashMap<String, Arc<WorkflowGraph>>,
    pub(crate) instances: InstanceStoreRef,
    pub(crate) async_states: AsyncStateStoreRef,
    pub(crate) suspensions: SuspensionStoreRef,
    pub(crate) interceptors: InterceptorChain,
    pub(crate) tasks: DashMap<String, Arc<dyn AsyncTask>>,
    pub(crate) locks: DashMap<String, Arc<AsyncMutex<()>>>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) cancel_flags: DashMap<String, CancelFlag>,
    pub(crate) completions: DashMap<String, watch::Sender<Option<TerminalOutcome>>>,
    pub(crate) accepting: AtomicBool,
    pub(crate) inflight: watch::Sender<usize>,
}

impl EngineCore {
    pub(crate) fn lock_for(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub(crate) fn cancel_flag(&self, instance_id: &str) -> CancelFlag {
        self.cancel_flags
            .entry(instance_id.to_string())
            .or_insert_with(CancelFlag::new)
            .clone()
    }

    /// Subscribes to the instance's terminal outcome.
    pub(crate) fn subscribe(&self, instance_id: &str) -> watch::Receiver<Option<TerminalOutcome>> {
        self.completions
            .entry(instance_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Broadcasts the terminal outcome and retires the channel.
    pub(crate) fn broadcast(&self, instance_id: &str, outcome: TerminalOutcome) {
        if let Some((_, sender)) = self.completions.remove(instance_id) {
            let _ = sender.send(Some(outcome));
        }
    }

    pub(crate) fn inflight_delta(&self, delta: i64) {
        self.inflight.send_modify(|count| {
            *count = (*count as i64 + delta).max(0) as usize;
        });
    }
}

/// Handle to a driven instance.
///
/// `settled` resolves once per `execute`/`resume` call, with the status the
/// scheduler parked the instance at. `result` resolves with the final
/// outcome once the instance reaches a terminal state, however many
/// suspensions happen in between.
#[derive(Debug)]
pub struct Handle {
    instance_id: String,
    completion: watch::Receiver<Option<TerminalOutcome>>,
    settled: Option<oneshot::Receiver<InstanceStatus>>,
}

impl Handle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Waits until the scheduling turn behind this handle parks the
    /// instance (suspended, awaiting async, or terminal).
    pub async fn settled(&mut self) -> Result<InstanceStatus> {
        match self.settled.take() {
            Some(receiver) => receiver.await.map_err(|_| EngineError::Store {
                detail: "scheduler dropped before settling".to_string(),
            }),
            None => Err(EngineError::IllegalState {
                instance_id: self.instance_id.clone(),
                status: InstanceStatus::Running,
                operation: "await settled twice".to_string(),
            }),
        }
    }

    /// Waits for the instance's final result.
    pub async fn result(mut self) -> TerminalOutcome {
        loop {
            if let Some(outcome) = self.completion.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if self.completion.changed().await.is_err() {
                return Err(EngineError::Store {
                    detail: "engine dropped before completion".to_string(),
                });
            }
        }
    }
}

/// Builder assembling a [`WorkflowEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    schemas: Arc<SchemaRegistry>,
    instances: Option<InstanceStoreRef>,
    async_states: Option<AsyncStateStoreRef>,
    suspensions: Option<SuspensionStoreRef>,
    interceptors: Vec<Arc<dyn ExecutionInterceptor>>,
    tasks: Vec<(String, Arc<dyn AsyncTask>)>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            schemas: Arc::new(SchemaRegistry::new()),
            instances: None,
            async_states: None,
            suspensions: None,
            interceptors: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_instance_store(mut self, store: InstanceStoreRef) -> Self {
        self.instances = Some(store);
        self
    }

    pub fn with_async_state_store(mut self, store: AsyncStateStoreRef) -> Self {
        self.async_states = Some(store);
        self
    }

    pub fn with_suspension_store(mut self, store: SuspensionStoreRef) -> Self {
        self.suspensions = Some(store);
        self
    }

    /// Appends an interceptor; order of registration is invocation order.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ExecutionInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Registers a background task under the id async steps dispatch to.
    pub fn with_task(mut self, task_id: impl Into<String>, task: Arc<dyn AsyncTask>) -> Self {
        self.tasks.push((task_id.into(), task));
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let worker_permits = self.config.worker_permits.max(1);
        let core = EngineCore {
            config: self.config,
            schemas: self.schemas,
            workflows: DashMap::new(),
            instances: self
                .instances
                .unwrap_or_else(|| Arc::new(MemoryInstanceStore::new())),
            async_states: self
                .async_states
                .unwrap_or_else(|| Arc::new(MemoryAsyncStateStore::new())),
            suspensions: self
                .suspensions
                .unwrap_or_else(|| Arc::new(MemorySuspensionStore::new())),
            interceptors: InterceptorChain::new(self.interceptors),
            tasks: {
                let map = DashMap::new();
                for (id, task) in self.tasks {
                    map.insert(id, task);
                }
                map
            },
            locks: DashMap::new(),
            workers: Arc::new(Semaphore::new(worker_permits)),
            cancel_flags: DashMap::new(),
            completions: DashMap::new(),
            accepting: AtomicBool::new(true),
            inflight: watch::channel(0usize).0,
        };
        WorkflowEngine {
            core: Arc::new(core),
        }
    }
}

/// The durable workflow engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    core: Arc<EngineCore>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Schema registry shared with graphs and the reducer.
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.core.schemas
    }

    /// Validates and registers a workflow. Graphs are immutable once
    /// registered; duplicate ids are rejected.
    pub fn register_workflow(&self, builder: GraphBuilder) -> Result<()> {
        let workflow_id = builder.workflow_id().to_string();
        if self.core.workflows.contains_key(&workflow_id) {
            return Err(EngineError::WorkflowExists { workflow_id });
        }
        let graph = builder.build(&self.core.schemas)?;
        info!(
            workflow_id = %graph.workflow_id(),
            version = %graph.version(),
            steps = graph.len(),
            "workflow registered"
        );
        self.core.workflows.insert(workflow_id, Arc::new(graph));
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowGraph>> {
        self.core
            .workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn list_workflows(&self) -> Vec<String> {
        self.core
            .workflows
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Registers a background task after build time.
    pub fn register_task(&self, task_id: impl Into<String>, task: Arc<dyn AsyncTask>) {
        self.core.tasks.insert(task_id.into(), task);
    }

    /// Creates a new instance of the workflow and starts driving it.
    ///
    /// The caller-supplied instance id (the chat/session id, typically)
    /// must be unused; an omitted id gets a fresh UUID.
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: impl Into<ExecutionInput>,
        instance_id: Option<String>,
    ) -> Result<Handle> {
        if !self.core.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let graph = self
            .get_workflow(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;

        let payload = self
            .core
            .schemas
            .coerce(input.into(), &graph.initial_step().input)?;

        let instance_id = instance_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.core.instances.get(&instance_id).await?.is_some() {
            return Err(EngineError::InstanceExists { instance_id });
        }

        let mut instance = WorkflowInstance::new(
            &instance_id,
            graph.workflow_id(),
            graph.version(),
            &graph.initial_step().id,
        );
        instance.current_input = Some(payload);
        instance.touch();
        self.core.instances.save(&instance).await?;
        metrics::INSTANCES_STARTED.inc();
        info!(instance_id = %instance_id, workflow_id, "instance created");

        let completion = self.core.subscribe(&instance_id);
        let (settled_tx, settled_rx) = oneshot::channel();
        self.core
            .spawn_turn(instance_id.clone(), TurnEntry::RunStep, Some(settled_tx));

        Ok(Handle {
            instance_id,
            completion,
            settled: Some(settled_rx),
        })
    }

    /// Feeds external input to a suspended instance.
    ///
    /// The input must satisfy the awaiting suspension's expected type;
    /// mismatches are rejected without state change. A duplicate resume
    /// after success yields `NOT_SUSPENDED`.
    pub async fn resume(
        &self,
        instance_id: &str,
        input: impl Into<ExecutionInput>,
    ) -> Result<Handle> {
        if !self.core.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let lock = self.core.lock_for(instance_id);
        let guard = tokio::time::timeout(self.core.config.lock_wait(), lock.lock_owned())
            .await
            .map_err(|_| EngineError::Busy {
                instance_id: instance_id.to_string(),
            })?;

        let mut instance = self
            .core
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        if instance.status != InstanceStatus::Suspended {
            return Err(EngineError::NotSuspended {
                instance_id: instance_id.to_string(),
            });
        }
        let suspension = self
            .core
            .suspensions
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotSuspended {
                instance_id: instance_id.to_string(),
            })?;

        let payload = suspension.match_input(&self.core.schemas, input.into())?;

        self.core.suspensions.delete(instance_id).await?;
        instance.status = InstanceStatus::Running;
        instance.current_input = Some(payload.clone());
        instance.touch();
        self.core.instances.save(&instance).await?;
        info!(instance_id, step_id = %suspension.step_id, "instance resumed");
        drop(guard);

        let completion = self.core.subscribe(instance_id);
        let (settled_tx, settled_rx) = oneshot::channel();
        self.core.spawn_turn(
            instance_id.to_string(),
            TurnEntry::Apply(StepResult::Continue { data: payload }),
            Some(settled_tx),
        );

        Ok(Handle {
            instance_id: instance_id.to_string(),
            completion,
            settled: Some(settled_rx),
        })
    }

    /// Requests cancellation. Returns whether the instance was (or will
    /// shortly be) transitioned to CANCELLED.
    pub async fn cancel(&self, instance_id: &str) -> Result<bool> {
        let instance = match self.core.instances.get(instance_id).await? {
            Some(instance) => instance,
            None => return Ok(false),
        };
        if instance.status.is_terminal() {
            return Ok(false);
        }

        // Running fibers observe the flag between steps and before
        // dispatching async work.
        self.core.cancel_flag(instance_id).cancel();

        // Parked instances have no fiber to observe the flag; take the
        // lock (bounded) and apply the transition here. A fiber that keeps
        // the lock past the wait handles the flag itself.
        let lock = self.core.lock_for(instance_id);
        if let Ok(_guard) =
            tokio::time::timeout(self.core.config.lock_wait(), lock.lock_owned()).await
        {
            let mut instance = match self.core.instances.get(instance_id).await? {
                Some(instance) => instance,
                None => return Ok(false),
            };
            if instance.status.is_terminal() {
                // A racing fiber may have applied the cancellation already.
                return Ok(instance.status == InstanceStatus::Cancelled);
            }
            if instance.status == InstanceStatus::Suspended {
                self.core.suspensions.delete(instance_id).await?;
            }
            if let Some(message_id) = instance.active_message_id.clone() {
                crate::memory::finish_async_state(
                    &self.core.async_states,
                    &message_id,
                    crate::async_task::AsyncTaskStatus::Cancelled,
                    None,
                    Some("instance cancelled".to_string()),
                )
                .await?;
            }
            instance.status = InstanceStatus::Cancelled;
            instance.current_input = None;
            instance.active_message_id = None;
            instance.touch();
            self.core.instances.save(&instance).await?;
            metrics::INSTANCES_CANCELLED.inc();
            self.core.broadcast(
                instance_id,
                Err(EngineError::Cancelled {
                    instance_id: instance_id.to_string(),
                }),
            );
            info!(instance_id, "instance cancelled");
            self.core.locks.remove(instance_id);
            self.core.cancel_flags.remove(instance_id);
        }
        Ok(true)
    }

    /// Reports the instance's current status.
    pub async fn status(&self, instance_id: &str) -> Result<StatusSnapshot> {
        let instance = self
            .core
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        let progress_percent = match (&instance.status, &instance.active_message_id) {
            (InstanceStatus::AwaitingAsync, Some(message_id)) => self
                .core
                .async_states
                .get(message_id)
                .await?
                .map(|state| state.progress_percent),
            _ => None,
        };

        Ok(StatusSnapshot {
            instance_id: instance.instance_id,
            status: instance.status,
            current_step_id: instance.current_step_id,
            progress_percent,
            last_error: instance.last_error,
        })
    }

    /// The pending suspension for an instance, if one is awaiting input.
    /// Carries the prompt the caller should surface to the user.
    pub async fn suspension(&self, instance_id: &str) -> Result<Option<crate::suspend::Suspension>> {
        Ok(self.core.suspensions.get(instance_id).await?)
    }

    /// Final result of a completed instance, read back from its context.
    pub async fn result_of(&self, instance_id: &str) -> Result<Option<Payload>> {
        let instance = self
            .core
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        Ok(instance.context.result().cloned())
    }

    /// Re-enters instances left non-terminal by a previous process.
    ///
    /// RUNNING (and NEW) instances re-enter the loop at their current step.
    /// AWAITING_ASYNC instances consume a completed task result when the
    /// async store has one; otherwise the owning step re-executes, since
    /// the in-process worker did not survive the restart.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for status in [InstanceStatus::New, InstanceStatus::Running] {
            for instance in self.core.instances.list_by_status(status).await? {
                self.core
                    .spawn_turn(instance.instance_id.clone(), TurnEntry::RunStep, None);
                recovered += 1;
            }
        }

        for instance in self
            .core
            .instances
            .list_by_status(InstanceStatus::AwaitingAsync)
            .await?
        {
            let entry = match &instance.active_message_id {
                Some(message_id) => match self.core.async_states.get(message_id).await? {
                    Some(state)
                        if state.status == crate::async_task::AsyncTaskStatus::Completed =>
                    {
                        match state.result {
                            Some(result) => TurnEntry::Apply(result),
                            None => TurnEntry::RunStep,
                        }
                    }
                    Some(_) | None => {
                        // The worker is gone; close the orphaned row and
                        // re-run the step.
                        if let Some(message_id) = instance.active_message_id.clone() {
                            let _ = crate::memory::finish_async_state(
                                &self.core.async_states,
                                &message_id,
                                crate::async_task::AsyncTaskStatus::Failed,
                                None,
                                Some("worker lost across restart".to_string()),
                            )
                            .await;
                        }
                        TurnEntry::RunStep
                    }
                },
                None => TurnEntry::RunStep,
            };
            self.core
                .spawn_turn(instance.instance_id.clone(), entry, None);
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "re-entered instances after restart");
        }
        Ok(recovered)
    }

    /// Spawns the periodic retention sweep over async state (and, when
    /// configured, suspensions).
    pub fn start_background_sweep(&self) -> JoinHandle<()> {
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now()
                    - chrono::Duration::hours(core.config.async_state_retention_hours as i64);
                match core.async_states.delete_older_than(cutoff).await {
                    Ok(deleted) if deleted > 0 => {
                        info!(deleted, "swept stale async task state");
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "async state sweep failed"),
                }

                if let Some(hours) = core.config.suspension_retention_hours {
                    let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
                    match core.suspensions.delete_older_than(cutoff).await {
                        Ok(deleted) if deleted > 0 => {
                            warn!(deleted, "swept suspensions past retention");
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "suspension sweep failed"),
                    }
                }
            }
        })
    }

    /// Stops intake and, when draining, waits for in-flight turns.
    pub async fn shutdown(&self, drain: bool) {
        self.core.accepting.store(false, Ordering::SeqCst);
        if drain {
            let mut inflight = self.core.inflight.subscribe();
            let _ = inflight.wait_for(|count| *count == 0).await;
        } else {
            for entry in self.core.cancel_flags.iter() {
                entry.value().cancel();
            }
        }
        info!(drain, "engine shut down");
    }
}
