//! Anthropic Messages API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use super::transport::{Transport, secret_header};
use super::{CompletionRequest, CompletionResponse, FinishReason, LlmClient, LlmError, TokenUsage};
use crate::config::LlmConfig;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    model: String,
    max_tokens: u32,
    transport: Transport,
}

impl AnthropicClient {
    /// Build from config; the key comes from the `api-key-env` variable
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(model = %config.model, base_url = %config.base_url, "AnthropicClient::from_config: called");
        let api_key = config
            .get_api_key()
            .ok_or_else(|| LlmError::MissingApiKey(config.api_key_env.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", secret_header(&api_key, &config.api_key_env)?);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let url = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
        let transport = Transport::new("anthropic", url, Duration::from_millis(config.timeout_ms), headers)?;
        Ok(Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            transport,
        })
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system_prompt,
            "messages": request.messages,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl From<MessagesReply> for CompletionResponse {
    fn from(reply: MessagesReply) -> Self {
        let content = reply
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        Self {
            content,
            finish: FinishReason::from_provider(reply.stop_reason.as_deref().unwrap_or("end_turn")),
            usage: TokenUsage {
                input_tokens: reply.usage.input_tokens,
                output_tokens: reply.usage.output_tokens,
            },
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, max_tokens = request.max_tokens, "AnthropicClient::complete: called");
        let reply: MessagesReply = self.transport.post(&self.body(&request)).await?;
        Ok(reply.into())
    }
}
