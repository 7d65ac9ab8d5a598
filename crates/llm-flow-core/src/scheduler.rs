// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduler: drives one instance from its current step to a parked or
//! terminal state.
//!
//! One fiber holds an instance at a time (per-instance mutex for the whole
//! turn); instances run in parallel on the engine's bounded worker pool.
//! Every state change persists before the loop moves on, so a reloaded
//! RUNNING instance makes the same decision on its next turn.

use crate::async_task::{
    timeout_result, AsyncStepState, AsyncTask, AsyncTaskContext, AsyncTaskStatus, ProgressReporter,
};
use crate::context::WorkflowContext;
use crate::engine::{EngineCore, TerminalOutcome};
use crate::error::{EngineError, Result};
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::interceptor::StepInvocation;
use crate::memory::finish_async_state;
use crate::metrics;
use crate::reducer::{failure_to_error, reduce, Transition};
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::schema::Payload;
use crate::step::{CancelFlag, OverflowPolicy, StepContext, StepDescriptor, StepResult};
use crate::store::{AsyncStateStore, InstanceStore, SuspensionStore};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a scheduling turn enters the loop.
pub(crate) enum TurnEntry {
    /// Execute the current step with the instance's staged input.
    RunStep,
    /// Apply an externally produced result (resume input or async
    /// completion) to the current step before moving on.
    Apply(StepResult),
}

type Settled = Option<oneshot::Sender<InstanceStatus>>;

fn settle(settled: &mut Settled, status: InstanceStatus) {
    if let Some(sender) = settled.take() {
        let _ = sender.send(status);
    }
}

impl EngineCore {
    pub(crate) fn spawn_turn(
        self: &Arc<Self>,
        instance_id: String,
        entry: TurnEntry,
        settled: Settled,
    ) {
        // Count the turn before it is scheduled so a drain that races the
        // spawn still waits for it.
        self.inflight_delta(1);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.run_turn(instance_id, entry, settled).await;
        });
    }

    async fn run_turn(self: Arc<Self>, instance_id: String, entry: TurnEntry, mut settled: Settled) {
        metrics::ACTIVE_INSTANCES.inc();
        let outcome = self.run_turn_inner(&instance_id, entry, &mut settled).await;
        if let Err(turn_error) = outcome {
            self.fail_instance(&instance_id, turn_error, &mut settled).await;
        }
        metrics::ACTIVE_INSTANCES.dec();
        self.inflight_delta(-1);
    }

    /// The scheduling loop for a single turn. Infrastructure errors bubble
    /// out and mark the instance FAILED in [`EngineCore::fail_instance`].
    async fn run_turn_inner(
        self: &Arc<Self>,
        instance_id: &str,
        entry: TurnEntry,
        settled: &mut Settled,
    ) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock_owned().await;
        let _permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };

        let mut instance = self
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        let graph = self
            .workflows
            .get(&instance.workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: instance.workflow_id.clone(),
            })?;

        let came_from_async = instance.status == InstanceStatus::AwaitingAsync;
        match instance.status {
            InstanceStatus::New => {
                instance.status = InstanceStatus::Running;
                instance.current_step_id = graph.initial_step().id.clone();
            }
            InstanceStatus::Running => {}
            InstanceStatus::AwaitingAsync => {
                instance.status = InstanceStatus::Running;
                instance.active_message_id = None;
            }
            status => {
                // Suspended instances wait for resume; terminal ones are
                // frozen. Nothing to drive.
                settle(settled, status);
                return Ok(());
            }
        }

        let cancel = self.cancel_flag(instance_id);
        let ctx = Arc::new(RwLock::new(instance.context.clone()));
        self.persist(&mut instance, &ctx).await?;

        let mut pending = match entry {
            TurnEntry::Apply(result) => Some(result),
            TurnEntry::RunStep => None,
        };
        // Set when a failed async attempt re-runs the step: a retry is not
        // a new invocation, so the limit counter must not move.
        let mut retrying = false;

        loop {
            if cancel.is_cancelled() {
                let cancelled = EngineError::Cancelled {
                    instance_id: instance_id.to_string(),
                };
                return self
                    .finish_terminal(
                        &mut instance,
                        &ctx,
                        InstanceStatus::Cancelled,
                        Err(cancelled),
                        settled,
                    )
                    .await;
            }

            let step = graph
                .step(&instance.current_step_id)
                .ok_or_else(|| EngineError::Store {
                    detail: format!(
                        "instance `{}` points at unknown step `{}`",
                        instance_id, instance.current_step_id
                    ),
                })?;

            let invocation = StepInvocation {
                instance_id: instance_id.to_string(),
                workflow_id: instance.workflow_id.clone(),
                step_id: step.id.clone(),
                attempt: instance
                    .retry_state
                    .get(&step.id)
                    .map(|state| state.attempts)
                    .unwrap_or(0)
                    + 1,
            };

            let step_result = match pending.take() {
                Some(applied) => {
                    // Results produced off-turn re-enter here: the resumed
                    // input (wrapped as Continue) or an async completion.
                    if came_from_async {
                        if let Some(payload) = applied.payload() {
                            if !self.schemas.is_assignable(&payload.schema, &step.output) {
                                let mismatch = EngineError::TypeMismatch {
                                    expected: step.output.clone(),
                                    actual: payload.schema.clone(),
                                };
                                self.interceptors.on_step_error(&invocation, &mismatch).await;
                                return self
                                    .finish_terminal(
                                        &mut instance,
                                        &ctx,
                                        InstanceStatus::Failed,
                                        Err(mismatch),
                                        settled,
                                    )
                                    .await;
                            }
                        }
                    }
                    match applied {
                        StepResult::Fail { error } => {
                            let step_error = failure_to_error(&step.id, error);
                            self.interceptors.on_step_error(&invocation, &step_error).await;
                            let policy = effective_policy(step, &self.config.default_retry);
                            let decision =
                                register_failure(&mut instance, &step.id, &step_error, policy.as_ref());
                            self.persist(&mut instance, &ctx).await?;
                            match decision {
                                RetryDecision::Retry { delay } => {
                                    metrics::STEP_RETRIES.inc();
                                    debug!(
                                        instance_id,
                                        step_id = %step.id,
                                        delay_ms = delay.as_millis() as u64,
                                        "retrying step after async failure"
                                    );
                                    tokio::time::sleep(delay).await;
                                    retrying = true;
                                    continue;
                                }
                                RetryDecision::Propagate => {
                                    return self
                                        .finish_terminal(
                                            &mut instance,
                                            &ctx,
                                            InstanceStatus::Failed,
                                            Err(step_error),
                                            settled,
                                        )
                                        .await;
                                }
                            }
                        }
                        other => {
                            self.interceptors.after_step(&invocation, &other).await;
                            other
                        }
                    }
                }
                None => {
                    // A fresh execution of the current step. Retries of a
                    // failed attempt do not count against the limit.
                    let counts = !std::mem::take(&mut retrying);
                    let next_count = instance.invocation_count(&step.id) + 1;
                    if let Some(limit) = step.invocation_limit {
                        if counts && next_count > limit {
                            match step.overflow {
                                OverflowPolicy::Error => {
                                    let exceeded = EngineError::InvocationLimitExceeded {
                                        step_id: step.id.clone(),
                                        limit,
                                    };
                                    self.interceptors.on_step_error(&invocation, &exceeded).await;
                                    return self
                                        .finish_terminal(
                                            &mut instance,
                                            &ctx,
                                            InstanceStatus::Failed,
                                            Err(exceeded),
                                            settled,
                                        )
                                        .await;
                                }
                                OverflowPolicy::Stop => {
                                    let last = ctx
                                        .read()
                                        .output(&step.id)
                                        .cloned()
                                        .or_else(|| instance.current_input.clone())
                                        .unwrap_or_else(|| Payload::empty(crate::schema::ANY_SCHEMA));
                                    info!(
                                        instance_id,
                                        step_id = %step.id,
                                        limit,
                                        "invocation limit reached, stopping with last output"
                                    );
                                    ctx.write().set_result(last.clone());
                                    return self
                                        .finish_terminal(
                                            &mut instance,
                                            &ctx,
                                            InstanceStatus::Completed,
                                            Ok(last),
                                            settled,
                                        )
                                        .await;
                                }
                                OverflowPolicy::Continue => {}
                            }
                        }
                    }
                    if counts {
                        instance.record_invocation(&step.id);
                    }

                    let input = instance.current_input.clone().ok_or_else(|| {
                        EngineError::Store {
                            detail: format!(
                                "instance `{}` has no staged input for step `{}`",
                                instance_id, step.id
                            ),
                        }
                    })?;

                    metrics::STEPS_EXECUTED.inc();
                    self.persist(&mut instance, &ctx).await?;
                    self.interceptors.before_step(&invocation).await;

                    match self
                        .execute_step_with_retry(&mut instance, step, input, &ctx, &cancel)
                        .await
                    {
                        Ok(result) => {
                            self.interceptors.after_step(&invocation, &result).await;
                            result
                        }
                        Err(EngineError::Cancelled { .. }) => {
                            let cancelled = EngineError::Cancelled {
                                instance_id: instance_id.to_string(),
                            };
                            return self
                                .finish_terminal(
                                    &mut instance,
                                    &ctx,
                                    InstanceStatus::Cancelled,
                                    Err(cancelled),
                                    settled,
                                )
                                .await;
                        }
                        Err(step_error) => {
                            return self
                                .finish_terminal(
                                    &mut instance,
                                    &ctx,
                                    InstanceStatus::Failed,
                                    Err(step_error),
                                    settled,
                                )
                                .await;
                        }
                    }
                }
            };

            match reduce(&graph, &self.schemas, instance_id, step, step_result)? {
                Transition::Advance {
                    next_step_id,
                    output,
                } => {
                    debug!(instance_id, from = %step.id, to = %next_step_id, "advancing");
                    ctx.write().set_output(&step.id, output.clone());
                    instance.current_step_id = next_step_id;
                    instance.current_input = Some(output);
                    self.persist(&mut instance, &ctx).await?;
                }
                Transition::Suspend(suspension) => {
                    self.suspensions.save(&suspension).await?;
                    instance.status = InstanceStatus::Suspended;
                    instance.current_input = None;
                    self.persist(&mut instance, &ctx).await?;
                    info!(
                        instance_id,
                        step_id = %suspension.step_id,
                        expected = %suspension.expected_input,
                        "instance suspended awaiting input"
                    );
                    settle(settled, InstanceStatus::Suspended);
                    return Ok(());
                }
                Transition::StartAsync {
                    task_id,
                    timeout_ms,
                    args,
                    immediate,
                } => {
                    ctx.write().set_output(&step.id, immediate);

                    let task = match self.tasks.get(&task_id) {
                        Some(task) => task.clone(),
                        None => {
                            let unknown = EngineError::UnknownTask { task_id };
                            self.interceptors.on_step_error(&invocation, &unknown).await;
                            return self
                                .finish_terminal(
                                    &mut instance,
                                    &ctx,
                                    InstanceStatus::Failed,
                                    Err(unknown),
                                    settled,
                                )
                                .await;
                        }
                    };

                    let message_id = Uuid::new_v4().to_string();
                    self.async_states
                        .save(&AsyncStepState::pending(&message_id, instance_id, &step.id))
                        .await?;

                    instance.status = InstanceStatus::AwaitingAsync;
                    instance.active_message_id = Some(message_id.clone());
                    self.persist(&mut instance, &ctx).await?;
                    metrics::ASYNC_TASKS_STARTED.inc();
                    info!(
                        instance_id,
                        step_id = %step.id,
                        message_id = %message_id,
                        timeout_ms,
                        "async task dispatched"
                    );

                    self.spawn_async_worker(
                        instance_id.to_string(),
                        step.id.clone(),
                        task,
                        message_id,
                        timeout_ms,
                        args,
                        cancel.clone(),
                    );
                    settle(settled, InstanceStatus::AwaitingAsync);
                    return Ok(());
                }
                Transition::Complete { result } => {
                    {
                        let mut guard = ctx.write();
                        guard.set_output(&step.id, result.clone());
                        guard.set_result(result.clone());
                    }
                    return self
                        .finish_terminal(
                            &mut instance,
                            &ctx,
                            InstanceStatus::Completed,
                            Ok(result),
                            settled,
                        )
                        .await;
                }
                Transition::Fail { error } => {
                    return self
                        .finish_terminal(
                            &mut instance,
                            &ctx,
                            InstanceStatus::Failed,
                            Err(error),
                            settled,
                        )
                        .await;
                }
            }
        }
    }

    /// Runs the step handler, looping through the retry engine on failure.
    /// `Ok` carries a non-`Fail` result; `Err` is the terminal step error
    /// after exhaustion (or cancellation observed during backoff).
    async fn execute_step_with_retry(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDescriptor,
        input: Payload,
        ctx: &Arc<RwLock<WorkflowContext>>,
        cancel: &CancelFlag,
    ) -> Result<StepResult> {
        let policy = effective_policy(step, &self.config.default_retry);
        loop {
            let attempt = instance
                .retry_state
                .get(&step.id)
                .map(|state| state.attempts)
                .unwrap_or(0)
                + 1;
            let step_ctx = StepContext::new(
                &instance.instance_id,
                &step.id,
                attempt,
                ctx.clone(),
                cancel.clone(),
            );

            let failure = match step.handler.run(input.clone(), &step_ctx).await {
                Ok(StepResult::Fail { error }) => failure_to_error(&step.id, error),
                Ok(result) => {
                    instance.clear_retry_state(&step.id);
                    return Ok(result);
                }
                Err(error) => error,
            };

            let invocation = StepInvocation {
                instance_id: instance.instance_id.clone(),
                workflow_id: instance.workflow_id.clone(),
                step_id: step.id.clone(),
                attempt,
            };
            self.interceptors.on_step_error(&invocation, &failure).await;

            let decision = register_failure(instance, &step.id, &failure, policy.as_ref());
            self.persist(instance, ctx).await?;

            match decision {
                RetryDecision::Retry { delay } => {
                    metrics::STEP_RETRIES.inc();
                    debug!(
                        instance_id = %instance.instance_id,
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "step failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled {
                            instance_id: instance.instance_id.clone(),
                        });
                    }
                }
                RetryDecision::Propagate => {
                    warn!(
                        instance_id = %instance.instance_id,
                        step_id = %step.id,
                        attempt,
                        error = %failure,
                        "step failed terminally"
                    );
                    return Err(failure);
                }
            }
        }
    }

    /// Background worker for one async task dispatch. Owns the task's state
    /// row until it writes exactly one terminal status, then feeds the
    /// result back through the scheduling loop.
    #[allow(clippy::too_many_arguments)]
    fn spawn_async_worker(
        self: &Arc<Self>,
        instance_id: String,
        step_id: String,
        task: Arc<dyn AsyncTask>,
        message_id: String,
        timeout_ms: u64,
        args: HashMap<String, Value>,
        cancel: CancelFlag,
    ) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match core.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if let Ok(Some(mut state)) = core.async_states.get(&message_id).await {
                if state.status == AsyncTaskStatus::Pending {
                    state.status = AsyncTaskStatus::Running;
                    if let Err(err) = core.async_states.save(&state).await {
                        error!(message_id = %message_id, error = %err, "failed to mark task running");
                    }
                }
            }

            let reporter = ProgressReporter::new(&message_id, core.async_states.clone());
            let task_ctx = AsyncTaskContext::new(
                &message_id,
                &instance_id,
                &step_id,
                reporter,
                cancel.clone(),
            );

            let outcome =
                tokio::time::timeout(Duration::from_millis(timeout_ms), task.run(args, task_ctx))
                    .await;

            let fed = match outcome {
                Err(_elapsed) => {
                    metrics::ASYNC_TASK_TIMEOUTS.inc();
                    warn!(
                        instance_id = %instance_id,
                        step_id = %step_id,
                        message_id = %message_id,
                        timeout_ms,
                        "async task timed out"
                    );
                    let _ = finish_async_state(
                        &core.async_states,
                        &message_id,
                        AsyncTaskStatus::TimedOut,
                        None,
                        Some(format!("deadline of {}ms exceeded", timeout_ms)),
                    )
                    .await;
                    timeout_result(timeout_ms)
                }
                Ok(Ok(result)) => {
                    let _ = finish_async_state(
                        &core.async_states,
                        &message_id,
                        AsyncTaskStatus::Completed,
                        Some(result.clone()),
                        None,
                    )
                    .await;
                    result
                }
                Ok(Err(task_error)) => {
                    let _ = finish_async_state(
                        &core.async_states,
                        &message_id,
                        AsyncTaskStatus::Failed,
                        None,
                        Some(task_error.to_string()),
                    )
                    .await;
                    StepResult::Fail {
                        error: crate::step::StepFailure {
                            kind: task_error.kind(),
                            message: task_error.to_string(),
                            retryable: task_error.is_retryable(),
                        },
                    }
                }
            };

            // Feed the result back even when cancellation raced the task:
            // the loop's cancel check finalizes the instance either way,
            // and terminal rows are written at most once.
            core.spawn_turn(instance_id, TurnEntry::Apply(fed), None);
        });
    }

    /// Writes the instance's terminal state, broadcasts the outcome, and
    /// releases per-instance runtime entries.
    async fn finish_terminal(
        &self,
        instance: &mut WorkflowInstance,
        ctx: &Arc<RwLock<WorkflowContext>>,
        status: InstanceStatus,
        outcome: TerminalOutcome,
        settled: &mut Settled,
    ) -> Result<()> {
        instance.status = status;
        if let Err(terminal_error) = &outcome {
            instance.last_error = Some(terminal_error.to_string());
        }
        instance.current_input = None;
        instance.active_message_id = None;
        self.persist(instance, ctx).await?;

        match status {
            InstanceStatus::Completed => metrics::INSTANCES_COMPLETED.inc(),
            InstanceStatus::Failed => metrics::INSTANCES_FAILED.inc(),
            InstanceStatus::Cancelled => metrics::INSTANCES_CANCELLED.inc(),
            _ => {}
        }
        info!(
            instance_id = %instance.instance_id,
            status = %status,
            "instance reached terminal state"
        );

        self.broadcast(&instance.instance_id, outcome);
        settle(settled, status);
        self.locks.remove(&instance.instance_id);
        self.cancel_flags.remove(&instance.instance_id);
        Ok(())
    }

    /// Best-effort FAILED marking for infrastructure errors that aborted a
    /// scheduling turn (store faults, corrupted cursors, reducer errors).
    async fn fail_instance(&self, instance_id: &str, turn_error: EngineError, settled: &mut Settled) {
        error!(instance_id, error = %turn_error, "scheduling turn failed");
        match self.instances.get(instance_id).await {
            Ok(Some(mut instance)) if !instance.status.is_terminal() => {
                instance.status = InstanceStatus::Failed;
                instance.last_error = Some(turn_error.to_string());
                instance.current_input = None;
                instance.active_message_id = None;
                instance.touch();
                if let Err(save_error) = self.instances.save(&instance).await {
                    error!(
                        instance_id,
                        error = %save_error,
                        "could not persist FAILED state"
                    );
                }
                metrics::INSTANCES_FAILED.inc();
            }
            Ok(_) => {}
            Err(load_error) => {
                error!(instance_id, error = %load_error, "could not reload instance");
            }
        }
        self.broadcast(instance_id, Err(turn_error));
        settle(settled, InstanceStatus::Failed);
        self.locks.remove(instance_id);
        self.cancel_flags.remove(instance_id);
    }

    /// Persists the instance with the live context snapshot.
    async fn persist(
        &self,
        instance: &mut WorkflowInstance,
        ctx: &Arc<RwLock<WorkflowContext>>,
    ) -> Result<()> {
        instance.context = ctx.read().clone();
        instance.touch();
        self.instances.save(instance).await?;
        Ok(())
    }
}

fn effective_policy(
    step: &StepDescriptor,
    default_retry: &Option<RetryPolicy>,
) -> Option<RetryPolicy> {
    step.retry.clone().or_else(|| default_retry.clone())
}

/// Updates the step's persisted retry state for a just-failed attempt and
/// decides what happens next.
fn register_failure(
    instance: &mut WorkflowInstance,
    step_id: &str,
    error: &EngineError,
    policy: Option<&RetryPolicy>,
) -> RetryDecision {
    let now = Utc::now();
    instance.last_error = Some(error.to_string());
    let state = instance.retry_state_mut(step_id);
    state.attempts += 1;
    state.last_failure_at = Some(now);
    state.last_error = Some(error.to_string());
    let attempts = state.attempts;

    let decision = retry::evaluate(policy, attempts, error);
    state.next_attempt_at = match &decision {
        RetryDecision::Retry { delay } => {
            Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64))
        }
        RetryDecision::Propagate => None,
    };
    decision
}
