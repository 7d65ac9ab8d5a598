// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step descriptors, handlers, and the step result variants.
//!
//! A step is registered as a [`StepDescriptor`]: identity, typed input and
//! output schemas, execution flags, and a typed dispatch closure. The
//! handler returns a [`StepResult`] *describing* the transition it wants;
//! the scheduler enacts it. Steps stay pure-by-return and never capture
//! continuation state.

use crate::context::WorkflowContext;
use crate::error::{EngineError, ErrorKind, Result};
use crate::retry::RetryPolicy;
use crate::schema::{Payload, ANY_SCHEMA};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Behavior when a step's invocation limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the instance with `INVOCATION_LIMIT_EXCEEDED`.
    #[default]
    Error,
    /// Complete the instance carrying the step's last produced output.
    Stop,
    /// Keep executing; the counter continues to grow.
    Continue,
}

/// Failure detail carried by [`StepResult::Fail`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    /// A retryable user-code failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StepError,
            message: message.into(),
            retryable: true,
        }
    }

    /// A terminal user-code failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StepError,
            message: message.into(),
            retryable: false,
        }
    }

    /// The failure fed back when an async task misses its deadline.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
            retryable: false,
        }
    }
}

/// The tagged result a step returns to signal its transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    /// Proceed to the single compatible next step.
    Continue { data: Payload },
    /// Proceed to the declared candidate whose input type matches `data`.
    Branch { data: Payload },
    /// Freeze the instance awaiting external input of the expected type.
    Suspend {
        prompt: Payload,
        expected_input: String,
        #[serde(default)]
        metadata: HashMap<String, Value>,
    },
    /// Start a background task and surface `immediate` right away.
    Async {
        task_id: String,
        timeout_ms: u64,
        #[serde(default)]
        args: HashMap<String, Value>,
        immediate: Payload,
    },
    /// Terminate the instance successfully.
    Finish { result: Payload },
    /// Signal an error, subject to the step's retry policy.
    Fail { error: StepFailure },
}

impl StepResult {
    /// Short variant name for logs and interceptors.
    pub fn variant(&self) -> &'static str {
        match self {
            StepResult::Continue { .. } => "continue",
            StepResult::Branch { .. } => "branch",
            StepResult::Suspend { .. } => "suspend",
            StepResult::Async { .. } => "async",
            StepResult::Finish { .. } => "finish",
            StepResult::Fail { .. } => "fail",
        }
    }

    /// The payload this result carries forward, when it carries one.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            StepResult::Continue { data } | StepResult::Branch { data } => Some(data),
            StepResult::Async { immediate, .. } => Some(immediate),
            StepResult::Finish { result } => Some(result),
            StepResult::Suspend { .. } | StepResult::Fail { .. } => None,
        }
    }
}

/// Cooperative cancellation flag shared between the scheduler, step code,
/// and async workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution-time view a step handler receives alongside its input.
///
/// Reads see a snapshot of prior step outputs; writes go to the custom
/// key/value map. Only the currently executing step holds this view, so
/// access is uncontended by construction.
#[derive(Clone)]
pub struct StepContext {
    instance_id: String,
    step_id: String,
    attempt: u32,
    context: Arc<RwLock<WorkflowContext>>,
    cancel: CancelFlag,
}

impl StepContext {
    pub(crate) fn new(
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt: u32,
        context: Arc<RwLock<WorkflowContext>>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            attempt,
            context,
            cancel,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// 1-based attempt number of the current execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Last output recorded for `step_id`, if that step has completed.
    pub fn output(&self, step_id: &str) -> Option<Payload> {
        self.context.read().output(step_id).cloned()
    }

    /// Reads a custom key set by an earlier step (or this one).
    pub fn get(&self, key: &str) -> Option<Value> {
        self.context.read().get(key).cloned()
    }

    /// Writes a custom key visible to later steps.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.context.write().put(key, value);
    }

    /// Whether cancellation has been requested; long-running synchronous
    /// steps should observe this at cooperative points.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

/// Typed dispatch closure of a registered step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, input: Payload, ctx: &StepContext) -> Result<StepResult>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(Payload, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResult>> + Send + 'static,
{
    async fn run(&self, input: Payload, ctx: &StepContext) -> Result<StepResult> {
        (self.0)(input, ctx.clone()).await
    }
}

/// Wraps an async closure as a [`StepHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(Payload, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Registration-time description of a step.
#[derive(Clone)]
pub struct StepDescriptor {
    pub id: String,
    pub description: String,
    /// Schema this step accepts as input.
    pub input: String,
    /// Wrapped output schema of the step's successful results.
    pub output: String,
    pub initial: bool,
    pub is_async: bool,
    /// Whether the step's declared outputs include a `Branch` variant.
    pub branching: bool,
    pub retry: Option<RetryPolicy>,
    pub invocation_limit: Option<u32>,
    pub overflow: OverflowPolicy,
    /// Declared next-step candidates, in author order.
    pub next: Vec<String>,
    pub handler: Arc<dyn StepHandler>,
}

impl std::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("initial", &self.initial)
            .field("is_async", &self.is_async)
            .field("branching", &self.branching)
            .field("invocation_limit", &self.invocation_limit)
            .field("overflow", &self.overflow)
            .field("next", &self.next)
            .finish()
    }
}

impl StepDescriptor {
    pub fn builder(id: impl Into<String>) -> StepBuilder {
        StepBuilder::new(id)
    }
}

/// Fluent builder for [`StepDescriptor`].
pub struct StepBuilder {
    id: String,
    description: String,
    input: String,
    output: String,
    initial: bool,
    is_async: bool,
    branching: bool,
    retry: Option<RetryPolicy>,
    invocation_limit: Option<u32>,
    overflow: OverflowPolicy,
    next: Vec<String>,
    handler: Option<Arc<dyn StepHandler>>,
}

impl StepBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            input: ANY_SCHEMA.to_string(),
            output: ANY_SCHEMA.to_string(),
            initial: false,
            is_async: false,
            branching: false,
            retry: None,
            invocation_limit: None,
            overflow: OverflowPolicy::default(),
            next: Vec::new(),
            handler: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Schema the step accepts; defaults to `any`.
    pub fn input(mut self, schema: impl Into<String>) -> Self {
        self.input = schema.into();
        self
    }

    /// Wrapped output schema; defaults to `any`.
    pub fn output(mut self, schema: impl Into<String>) -> Self {
        self.output = schema.into();
        self
    }

    /// Marks this step as the workflow entry point.
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Marks this step as dispatching background work.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Declares that the step may return `Branch`; candidates must then be
    /// enumerated via [`StepBuilder::next`].
    pub fn branching(mut self) -> Self {
        self.branching = true;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Caps how many times the step may begin execution and picks the
    /// behavior on overflow.
    pub fn invocation_limit(mut self, limit: u32, overflow: OverflowPolicy) -> Self {
        self.invocation_limit = Some(limit);
        self.overflow = overflow;
        self
    }

    /// Appends a declared next-step candidate.
    pub fn next(mut self, step_id: impl Into<String>) -> Self {
        self.next.push(step_id.into());
        self
    }

    pub fn handler(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Convenience for [`handler_fn`].
    pub fn handle_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Payload, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult>> + Send + 'static,
    {
        self.handler(handler_fn(f))
    }

    pub fn build(self) -> Result<StepDescriptor> {
        let handler = self.handler.ok_or_else(|| EngineError::InvalidStepConfig {
            step_id: self.id.clone(),
            reason: "missing handler".to_string(),
        })?;
        if self.id.is_empty() {
            return Err(EngineError::InvalidStepConfig {
                step_id: self.id,
                reason: "empty step id".to_string(),
            });
        }
        Ok(StepDescriptor {
            id: self.id,
            description: self.description,
            input: self.input,
            output: self.output,
            initial: self.initial,
            is_async: self.is_async,
            branching: self.branching,
            retry: self.retry,
            invocation_limit: self.invocation_limit,
            overflow: self.overflow,
            next: self.next,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> Arc<dyn StepHandler> {
        handler_fn(|input, _ctx| async move { Ok(StepResult::Finish { result: input }) })
    }

    #[test]
    fn test_builder_defaults() {
        let step = StepDescriptor::builder("greet")
            .handler(noop_handler())
            .build()
            .unwrap();
        assert_eq!(step.input, ANY_SCHEMA);
        assert_eq!(step.output, ANY_SCHEMA);
        assert!(!step.initial);
        assert!(!step.is_async);
        assert_eq!(step.overflow, OverflowPolicy::Error);
    }

    #[test]
    fn test_builder_missing_handler() {
        let err = StepDescriptor::builder("greet").build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidStepConfig { .. }));
    }

    #[tokio::test]
    async fn test_handler_fn_runs() {
        let step = StepDescriptor::builder("echo")
            .handle_fn(|input, _ctx| async move { Ok(StepResult::Continue { data: input }) })
            .build()
            .unwrap();

        let ctx = StepContext::new(
            "inst",
            "echo",
            1,
            Arc::new(RwLock::new(WorkflowContext::new())),
            CancelFlag::new(),
        );
        let result = step
            .handler
            .run(Payload::new("Foo", json!({"x": 1})), &ctx)
            .await
            .unwrap();
        assert_eq!(result.variant(), "continue");
    }

    #[test]
    fn test_step_result_serde_round_trip() {
        let result = StepResult::Suspend {
            prompt: Payload::new("Prompt", json!({"text": "name?"})),
            expected_input: "UserName".to_string(),
            metadata: HashMap::new(),
        };
        let encoded = serde_json::to_string(&result).unwrap();
        assert!(encoded.contains("\"type\":\"suspend\""));
        let decoded: StepResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.variant(), "suspend");
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let observer = flag.clone();
        flag.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_step_context_custom_values() {
        let ctx = StepContext::new(
            "inst",
            "s1",
            1,
            Arc::new(RwLock::new(WorkflowContext::new())),
            CancelFlag::new(),
        );
        ctx.put("tone", json!("friendly"));
        assert_eq!(ctx.get("tone"), Some(json!("friendly")));
        assert_eq!(ctx.get("missing"), None);
    }
}
