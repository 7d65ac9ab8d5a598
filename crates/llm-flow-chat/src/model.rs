//! Model invocation capability.
//!
//! Provider adapters (HTTP clients for hosted models) live outside this
//! workspace; steps talk to whatever implements [`ModelClient`].

use crate::chat::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A completion request built from conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model identifier, provider-specific.
    pub model: String,

    /// System prompt (optional).
    pub system: Option<String>,

    /// Conversation turns, oldest first.
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Generation cap.
    pub max_tokens: Option<u32>,
}

/// A completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text.
    pub text: String,

    /// Model that produced it.
    pub model: String,

    /// Tokens consumed, when the provider reports it.
    pub tokens_used: Option<u32>,
}

/// Model invocation error.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Provider throttled the request.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Request was malformed for this provider.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider-side failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,
}

impl ModelError {
    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ModelError::InvalidRequest(_))
    }
}

/// Capability for generating model completions.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Client name for logs.
    fn name(&self) -> &str;

    /// Liveness probe; defaults to healthy.
    async fn health_check(&self) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Reference client answering every request with a fixed text. Useful in
/// tests and offline examples.
#[derive(Debug, Clone)]
pub struct StaticModelClient {
    reply: String,
}

impl StaticModelClient {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl ModelClient for StaticModelClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        Ok(ModelResponse {
            text: self.reply.clone(),
            model: request.model,
            tokens_used: None,
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}
