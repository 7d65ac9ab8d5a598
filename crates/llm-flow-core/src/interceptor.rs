// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution interceptors: side-effect-only hooks around each step call.

use crate::error::EngineError;
use crate::step::StepResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of one step execution, handed to every hook.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub instance_id: String,
    pub workflow_id: String,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Observer invoked around each step execution.
///
/// Interceptors must not alter results; they observe. `on_step_error` fires
/// for every step-level error, including failures the retry engine will
/// re-attempt.
#[async_trait]
pub trait ExecutionInterceptor: Send + Sync {
    async fn before_step(&self, _invocation: &StepInvocation) {}

    async fn after_step(&self, _invocation: &StepInvocation, _result: &StepResult) {}

    async fn on_step_error(&self, _invocation: &StepInvocation, _error: &EngineError) {}
}

/// Fixed, ordered list of interceptors assembled at engine build time.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ExecutionInterceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn ExecutionInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn before_step(&self, invocation: &StepInvocation) {
        for interceptor in &self.interceptors {
            interceptor.before_step(invocation).await;
        }
    }

    pub async fn after_step(&self, invocation: &StepInvocation, result: &StepResult) {
        for interceptor in &self.interceptors {
            interceptor.after_step(invocation, result).await;
        }
    }

    pub async fn on_step_error(&self, invocation: &StepInvocation, error: &EngineError) {
        for interceptor in &self.interceptors {
            interceptor.on_step_error(invocation, error).await;
        }
    }
}

/// Reference interceptor emitting structured trace events per step.
#[derive(Debug, Default)]
pub struct TracingInterceptor;

#[async_trait]
impl ExecutionInterceptor for TracingInterceptor {
    async fn before_step(&self, invocation: &StepInvocation) {
        debug!(
            instance_id = %invocation.instance_id,
            workflow_id = %invocation.workflow_id,
            step_id = %invocation.step_id,
            attempt = invocation.attempt,
            "step starting"
        );
    }

    async fn after_step(&self, invocation: &StepInvocation, result: &StepResult) {
        info!(
            instance_id = %invocation.instance_id,
            step_id = %invocation.step_id,
            result = result.variant(),
            "step finished"
        );
    }

    async fn on_step_error(&self, invocation: &StepInvocation, error: &EngineError) {
        info!(
            instance_id = %invocation.instance_id,
            step_id = %invocation.step_id,
            attempt = invocation.attempt,
            error = %error,
            "step errored"
        );
    }
}
