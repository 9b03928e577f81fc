//! Anti-forgery token lifecycle for the proxy client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::validate::ChatMessage;

/// How long a fetched token is trusted before the client refreshes it. Kept
/// shorter than the server-side TTL so refreshes happen while the old token
/// is still valid.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A rejected token is refetched and the request replayed at most this often.
const MAX_CSRF_RETRIES: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Two consecutive CSRF rejections: the session itself is gone.
    #[error("session expired, a new session is required")]
    SessionExpired,
    #[error("rate limited, retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },
    /// The active chat changed while the request was in flight; the reply
    /// was discarded.
    #[error("response discarded, the active chat changed while in flight")]
    StaleResponse,
    #[error("{code}: {message}")]
    Api { code: String, message: String },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// HTTP client for a chatgate server. Holds the session cookie jar and the
/// cached CSRF token; safe to share behind an [`Arc`].
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    refresh_interval: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        // The cookie jar carries the session cookie the token is bound to.
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            refresh_interval: TOKEN_REFRESH_INTERVAL,
            token: Mutex::new(None),
        })
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_token(&self) -> Result<String, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/csrf-token", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let token = body
            .get("csrfToken")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Api {
                code: "SERVER_ERROR".to_string(),
                message: "token endpoint returned no csrfToken".to_string(),
            })?;
        *self.token.lock().await = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + self.refresh_interval,
        });
        tracing::debug!("fetched fresh CSRF token");
        Ok(token)
    }

    /// Return the cached token, fetching a new one first if it is absent or
    /// past its refresh deadline.
    async fn ensure_token(&self) -> Result<String, ClientError> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref() {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.value.clone());
                }
            }
        }
        self.fetch_token().await
    }

    /// Drop the cached token so the next request fetches a fresh one.
    pub async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Whether a token is cached and still inside its refresh window.
    pub async fn has_fresh_token(&self) -> bool {
        self.token
            .lock()
            .await
            .as_ref()
            .map(|t| Instant::now() < t.expires_at)
            .unwrap_or(false)
    }

    /// Refresh the token if it is due to expire. The hook for background
    /// timers and host visibility-change callbacks; does nothing when the
    /// cached token is still fresh.
    pub async fn refresh_if_due(&self) -> Result<(), ClientError> {
        let due = {
            let guard = self.token.lock().await;
            guard
                .as_ref()
                .map(|t| Instant::now() >= t.expires_at)
                .unwrap_or(true)
        };
        if due {
            self.fetch_token().await?;
        }
        Ok(())
    }

    /// Spawn a background task refreshing the token whenever it is due,
    /// checked every `period`, independent of user action.
    pub fn spawn_refresh_task(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = client.refresh_if_due().await {
                    tracing::debug!(error = %err, "background token refresh failed");
                }
            }
        })
    }

    /// POST a conversation to the proxy, transparently handling the token
    /// lifecycle: ensure a fresh token first, and on a CSRF rejection clear
    /// the cache, refetch and retry the request exactly once. A second
    /// rejection surfaces as [`ClientError::SessionExpired`].
    pub async fn send_chat(
        &self,
        model: Option<&str>,
        messages: &[ChatMessage],
    ) -> Result<Value, ClientError> {
        let mut retries = 0u32;
        loop {
            let token = self.ensure_token().await?;
            let mut body = serde_json::json!({ "messages": messages });
            if let Some(model) = model {
                body["model"] = Value::String(model.to_string());
            }
            let response = self
                .http
                .post(format!("{}/api/chat", self.base_url))
                .header("CSRF-Token", &token)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            if status.is_success() {
                return Ok(payload);
            }

            let code = payload
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if code == "CSRF_INVALID" {
                self.invalidate_token().await;
                if retries < MAX_CSRF_RETRIES {
                    retries += 1;
                    tracing::debug!("CSRF token rejected, refreshing and retrying once");
                    continue;
                }
                return Err(ClientError::SessionExpired);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = payload
                    .get("retryAfter")
                    .and_then(Value::as_u64)
                    .unwrap_or(60);
                return Err(ClientError::RateLimited { retry_after });
            }
            let message = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(ClientError::Api {
                code: if code.is_empty() {
                    "SERVER_ERROR".to_string()
                } else {
                    code
                },
                message,
            });
        }
    }
}
