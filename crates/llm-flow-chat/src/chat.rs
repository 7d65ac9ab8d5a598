//! Chat message storage capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One message in a conversation, keyed to its chat (instance) id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: String,
    pub role: ChatRole,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(chat_id: impl Into<String>, role: ChatRole, content: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            role,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn user(chat_id: impl Into<String>, content: Value) -> Self {
        Self::new(chat_id, ChatRole::User, content)
    }

    pub fn assistant(chat_id: impl Into<String>, content: Value) -> Self {
        Self::new(chat_id, ChatRole::Assistant, content)
    }
}

/// Error type for chat storage operations
#[derive(Debug, Error)]
pub enum ChatStoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Capability the engine's chat tracker and model steps write through.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Appends a message to its conversation.
    async fn append(&self, message: ChatMessage) -> Result<(), ChatStoreError>;

    /// Most recent messages of a conversation, oldest first, capped at
    /// `limit` (0 means no cap).
    async fn history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>, ChatStoreError>;
}

/// Type alias for Arc-wrapped ChatStore
pub type ChatStoreRef = Arc<dyn ChatStore>;

/// In-memory reference chat store.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    conversations: DashMap<String, Vec<ChatMessage>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn append(&self, message: ChatMessage) -> Result<(), ChatStoreError> {
        self.conversations
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn history(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>, ChatStoreError> {
        let messages = self
            .conversations
            .get(chat_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if limit == 0 || messages.len() <= limit {
            return Ok(messages);
        }
        Ok(messages[messages.len() - limit..].to_vec())
    }
}
