//! Completion client errors

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Unknown LLM provider '{0}' (supported: anthropic, openai)")]
    UnknownProvider(String),

    #[error("No API key: export {0}")]
    MissingApiKey(String),

    #[error("API key in {0} is not a valid header value")]
    InvalidApiKey(String),

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} rate limited the request, retry after {retry_after:?}")]
    RateLimited {
        provider: &'static str,
        retry_after: Duration,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Could not decode {provider} response: {reason}")]
    Decode { provider: &'static str, reason: String },

    #[error("Giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Failures another attempt may fix; rate limits are reported, not retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 500 | 502 | 503 | 504 | 529),
            _ => false,
        }
    }
}
