//! LLM clients for the staged pipeline
//!
//! Each pipeline stage is one [`LlmClient::complete`] call. Providers share
//! one retrying HTTP transport and differ only in request and reply shape.

use std::sync::Arc;

use tracing::debug;

mod anthropic;
pub mod client;
mod error;
mod openai;
mod transport;
mod types;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAIClient;
pub use types::{CompletionRequest, CompletionResponse, FinishReason, Message, Role, TokenUsage};

use crate::config::LlmConfig;

/// Client for `llm.provider`
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(provider = %config.provider, model = %config.model, "create_client: called");
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        "openai" => Ok(Arc::new(OpenAIClient::from_config(config)?)),
        other => Err(LlmError::UnknownProvider(other.to_string())),
    }
}
