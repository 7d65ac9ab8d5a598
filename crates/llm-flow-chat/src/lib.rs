//! Chat-side capabilities for the llm-flow engine.
//!
//! The engine core never talks to a model provider or a chat database
//! directly; it consumes the capability traits defined here. This crate
//! ships the trait surface plus lightweight reference implementations: an
//! in-memory chat store, a Handlebars prompt renderer, a model-invoking
//! step handler, and the chat-tracking interceptor that mirrors engine
//! activity into a conversation.

pub mod chat;
pub mod model;
pub mod prompt;
pub mod steps;
pub mod tracking;

pub use chat::{ChatMessage, ChatRole, ChatStore, ChatStoreError, ChatStoreRef, MemoryChatStore};
pub use model::{ModelClient, ModelError, ModelRequest, ModelResponse, StaticModelClient};
pub use prompt::{HandlebarsPromptService, PromptError, PromptService};
pub use steps::ModelStep;
pub use tracking::ChatTrackingInterceptor;
