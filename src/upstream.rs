//! Upstream chat completion client.
//!
//! The proxy forwards validated requests through the [`ChatUpstream`] trait so
//! the HTTP layer stays independent of the concrete provider. The shipped
//! implementation targets the OpenRouter-compatible completion API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Fixed generation parameters forwarded with every completion request.
/// Bounded output keeps per-request cost predictable.
pub const MAX_COMPLETION_TOKENS: u32 = 1000;
pub const SAMPLING_TEMPERATURE: f64 = 0.7;

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The upstream answered with a non-success status. `detail` carries the
    /// upstream body for server-side logging; it must never reach the client.
    #[error("upstream returned status {status}")]
    Status { status: u16, detail: Value },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait ChatUpstream: Send + Sync {
    /// Forward a validated `{model, messages}` pair and return the upstream
    /// JSON body verbatim.
    async fn complete(&self, model: &str, messages: &Value) -> Result<Value, UpstreamError>;
}

pub struct OpenRouterClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    referer: String,
}

impl OpenRouterClient {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        referer: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            referer: referer.into(),
        })
    }
}

#[async_trait]
impl ChatUpstream for OpenRouterClient {
    async fn complete(&self, model: &str, messages: &Value) -> Result<Value, UpstreamError> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "temperature": SAMPLING_TEMPERATURE,
        });
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", "AI Chat Assistant")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail: Value = response.json().await.unwrap_or(Value::Null);
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                detail,
            });
        }
        // A success status with an undecodable body is still a failure.
        Ok(response.json().await?)
    }
}
