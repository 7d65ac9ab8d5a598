//! The chat-tracking interceptor: mirrors engine activity into the
//! conversation so the user-facing transcript stays complete.

use crate::chat::{ChatMessage, ChatStore, ChatStoreRef};
use async_trait::async_trait;
use llm_flow_core::{ExecutionInterceptor, StepInvocation, StepResult};
use serde_json::json;
use tracing::warn;

/// Appends `Suspend` prompts, `Async` immediate data, and `Finish` results
/// to the chat store as assistant-authored messages. Side-effect only;
/// store failures are logged, never propagated into the run.
pub struct ChatTrackingInterceptor {
    store: ChatStoreRef,
}

impl ChatTrackingInterceptor {
    pub fn new(store: ChatStoreRef) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExecutionInterceptor for ChatTrackingInterceptor {
    async fn after_step(&self, invocation: &StepInvocation, result: &StepResult) {
        let content = match result {
            StepResult::Suspend { prompt, .. } => {
                json!({"kind": "prompt", "body": prompt.data})
            }
            StepResult::Async { immediate, .. } => {
                json!({"kind": "progress", "body": immediate.data})
            }
            StepResult::Finish { result } => {
                json!({"kind": "result", "body": result.data})
            }
            _ => return,
        };

        let message = ChatMessage::assistant(&invocation.instance_id, content);
        if let Err(err) = self.store.append(message).await {
            warn!(
                instance_id = %invocation.instance_id,
                step_id = %invocation.step_id,
                error = %err,
                "chat tracking append failed"
            );
        }
    }
}
