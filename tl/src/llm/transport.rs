//! HTTP transport shared by the providers
//!
//! POSTs a JSON body and retries transient failures with exponential backoff.
//! A 429 fails the call at once, carrying the server's `retry-after`.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::LlmError;

/// Attempts per call, including the first
pub(crate) const MAX_ATTEMPTS: u32 = 4;

const INITIAL_BACKOFF_MS: u64 = 1000;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Delay before retry number `retry` (1-based)
pub(crate) fn backoff_for(retry: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS << retry.saturating_sub(1).min(16))
}

/// Header value for a credential, hidden from debug output
pub(crate) fn secret_header(value: &str, env: &str) -> Result<HeaderValue, LlmError> {
    let mut header = HeaderValue::from_str(value).map_err(|_| LlmError::InvalidApiKey(env.to_string()))?;
    header.set_sensitive(true);
    Ok(header)
}

pub(crate) struct Transport {
    provider: &'static str,
    url: String,
    http: Client,
}

impl Transport {
    pub(crate) fn new(
        provider: &'static str,
        url: String,
        timeout: Duration,
        headers: HeaderMap,
    ) -> Result<Self, LlmError> {
        debug!(%provider, %url, ?timeout, "Transport::new: called");
        let http = Client::builder().timeout(timeout).default_headers(headers).build()?;
        Ok(Self { provider, url, http })
    }

    pub(crate) fn provider(&self) -> &'static str {
        self.provider
    }

    /// POST `body` and decode the reply as `T`
    pub(crate) async fn post<T: DeserializeOwned>(&self, body: &serde_json::Value) -> Result<T, LlmError> {
        let mut attempt = 1;
        loop {
            match self.post_once(body).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = backoff_for(attempt);
                    warn!(
                        provider = self.provider,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient LLM failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(LlmError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once<T: DeserializeOwned>(&self, body: &serde_json::Value) -> Result<T, LlmError> {
        debug!(provider = self.provider, "Transport::post_once: called");
        let response = self.http.post(&self.url).json(body).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            debug!(provider = self.provider, retry_after, "Transport::post_once: rate limited");
            return Err(LlmError::RateLimited {
                provider: self.provider,
                retry_after: Duration::from_secs(retry_after),
            });
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http {
                provider: self.provider,
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| LlmError::Decode {
            provider: self.provider,
            reason: e.to_string(),
        })
    }
}
