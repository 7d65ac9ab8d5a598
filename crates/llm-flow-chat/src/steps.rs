//! A step handler that renders a prompt and calls the model capability.

use crate::chat::ChatMessage;
use crate::model::{ModelClient, ModelRequest};
use crate::prompt::PromptService;
use async_trait::async_trait;
use llm_flow_core::{
    EngineError, Payload, StepContext, StepFailure, StepHandler, StepResult,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Step handler wiring a prompt template to a [`ModelClient`].
///
/// The incoming payload's body feeds the template; the model's reply
/// continues the workflow as `{ "text": ... }` under the configured output
/// schema. Model failures surface as `Fail` results so the engine's retry
/// policy governs re-attempts.
pub struct ModelStep {
    client: Arc<dyn ModelClient>,
    prompts: Arc<dyn PromptService>,
    template: String,
    model: String,
    system: Option<String>,
    output_schema: String,
}

impl ModelStep {
    pub fn new(
        client: Arc<dyn ModelClient>,
        prompts: Arc<dyn PromptService>,
        template: impl Into<String>,
        model: impl Into<String>,
        output_schema: impl Into<String>,
    ) -> Self {
        Self {
            client,
            prompts,
            template: template.into(),
            model: model.into(),
            system: None,
            output_schema: output_schema.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[async_trait]
impl StepHandler for ModelStep {
    async fn run(&self, input: Payload, ctx: &StepContext) -> llm_flow_core::Result<StepResult> {
        let prompt = self
            .prompts
            .render(&self.template, &input.data)
            .map_err(|err| EngineError::StepError {
                step_id: ctx.step_id().to_string(),
                message: format!("prompt rendering failed: {}", err),
                retryable: false,
            })?;

        debug!(
            instance_id = %ctx.instance_id(),
            step_id = %ctx.step_id(),
            model = %self.model,
            "calling model"
        );

        let request = ModelRequest {
            model: self.model.clone(),
            system: self.system.clone(),
            messages: vec![ChatMessage::user(
                ctx.instance_id(),
                json!({"text": prompt}),
            )],
            temperature: None,
            max_tokens: None,
        };

        match self.client.complete(request).await {
            Ok(response) => Ok(StepResult::Continue {
                data: Payload::new(
                    &self.output_schema,
                    json!({"text": response.text, "model": response.model}),
                ),
            }),
            Err(err) => Ok(StepResult::Fail {
                error: if err.is_retryable() {
                    StepFailure::retryable(err.to_string())
                } else {
                    StepFailure::fatal(err.to_string())
                },
            }),
        }
    }
}
