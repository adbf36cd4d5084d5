//! Client side of the model collaborator: wire types, the streaming
//! reassembly buffer and an HTTP client for OpenAI-compatible endpoints.

mod client;
mod stream;
mod types;

pub use client::HttpLlmClient;
pub use stream::StreamAccumulator;
pub use types::{
    ChatDelta, ChatMessage, FunctionCall, FunctionFragment, FunctionSpec, ToolCall,
    ToolCallFragment, ToolSpec,
};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::DbError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Endpoint settings, built once at startup and injected into the session.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        LlmConfig {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// The completion surface the session depends on. Sessions hold a boxed
/// backend so tests can script the collaborator's behavior.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatMessage, DbError>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<BoxStream<'static, Result<ChatDelta, DbError>>, DbError>;
}
