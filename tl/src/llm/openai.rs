//! OpenAI Chat Completions API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use tracing::debug;

use super::transport::{Transport, secret_header};
use super::{CompletionRequest, CompletionResponse, FinishReason, LlmClient, LlmError, Message, TokenUsage};
use crate::config::LlmConfig;

/// Model families that reject `max_tokens` in favour of `max_completion_tokens`
const COMPLETION_TOKEN_MODELS: [&str; 3] = ["gpt-5", "o1", "o3"];

pub struct OpenAIClient {
    model: String,
    max_tokens: u32,
    transport: Transport,
}

impl OpenAIClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(model = %config.model, base_url = %config.base_url, "OpenAIClient::from_config: called");
        let api_key = config
            .get_api_key()
            .ok_or_else(|| LlmError::MissingApiKey(config.api_key_env.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, secret_header(&format!("Bearer {}", api_key), &config.api_key_env)?);

        let url = format!("{}/v1/chat/completions", config.base_url.trim_end_matches('/'));
        let transport = Transport::new("openai", url, Duration::from_millis(config.timeout_ms), headers)?;
        Ok(Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            transport,
        })
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(Message::system(request.system_prompt.clone()));
        messages.extend(request.messages.iter().cloned());

        let limit_key = if COMPLETION_TOKEN_MODELS.iter().any(|p| self.model.starts_with(p)) {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        body[limit_key] = serde_json::json!(request.max_tokens.min(self.max_tokens));
        body
    }

    fn response_from(&self, reply: ChatReply) -> Result<CompletionResponse, LlmError> {
        let choice = reply.choices.into_iter().next().ok_or_else(|| LlmError::Decode {
            provider: self.transport.provider(),
            reason: "no choices in reply".to_string(),
        })?;
        let usage = reply.usage.unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish: FinishReason::from_provider(choice.finish_reason.as_deref().unwrap_or("stop")),
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, max_tokens = request.max_tokens, "OpenAIClient::complete: called");
        let reply: ChatReply = self.transport.post(&self.body(&request)).await?;
        self.response_from(reply)
    }
}
