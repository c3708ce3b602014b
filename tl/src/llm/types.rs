//! Completion request and response shapes
//!
//! A stage is one single-shot text completion, so only plain text messages
//! exist here.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything needed for one completion call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// The stage's system prompt
    pub system_prompt: String,

    /// Rendered stage prompt(s)
    pub messages: Vec<Message>,

    /// Upper bound on response length; providers cap it further
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// System message, for providers that carry the system prompt inline
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the answer
    Complete,
    /// Cut off at the token limit; the output is likely incomplete
    Truncated,
    Other,
}

impl FinishReason {
    /// Map a provider's stop or finish reason
    pub fn from_provider(reason: &str) -> Self {
        debug!(%reason, "FinishReason::from_provider: called");
        match reason {
            "end_turn" | "stop_sequence" | "stop" => Self::Complete,
            "max_tokens" | "length" => Self::Truncated,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Concatenated text output; empty when the model produced none
    pub content: String,
    pub finish: FinishReason,
    pub usage: TokenUsage,
}

impl CompletionResponse {
    pub fn text(&self) -> &str {
        &self.content
    }

    pub fn is_truncated(&self) -> bool {
        self.finish == FinishReason::Truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_across_providers() {
        assert_eq!(FinishReason::from_provider("end_turn"), FinishReason::Complete);
        assert_eq!(FinishReason::from_provider("stop"), FinishReason::Complete);
        assert_eq!(FinishReason::from_provider("max_tokens"), FinishReason::Truncated);
        assert_eq!(FinishReason::from_provider("length"), FinishReason::Truncated);
        assert_eq!(FinishReason::from_provider("tool_use"), FinishReason::Other);
    }

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let json = serde_json::to_value(Message::system("be terse")).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(serde_json::to_value(Message::user("hi")).unwrap()["role"], "user");
    }
}
