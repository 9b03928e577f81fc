//! Core library for Chatgate. This module wires together the validation
//! gates, security middleware state and HTTP handlers for the proxy. The
//! client half of the system (token lifecycle, local chat persistence) lives
//! under [`client`].

mod config;
mod telemetry;

pub mod client;
pub mod csrf;
pub mod ratelimit;
pub mod upstream;
pub mod validate;

pub use config::{AppConfig, RotationConfig, DEFAULT_ALLOWED_MODELS};
pub use telemetry::{RequestLog, RequestOutcome, RotatingWriter};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::{BytesRejection, FailedToBufferBody, JsonRejection};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::csrf::CsrfStore;
use crate::ratelimit::SlidingWindowLimiter;
use crate::upstream::{ChatUpstream, OpenRouterClient, UpstreamError};

/// Header carrying the anti-forgery token on state-mutating requests.
pub const CSRF_HEADER: &str = "csrf-token";

const CHAT_PATH: &str = "/api/chat";

/// Internal application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub allowed_models: Arc<Vec<String>>,
    pub allowed_origins: Arc<Vec<String>>,
    pub csrf: Arc<CsrfStore>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub upstream: Arc<dyn ChatUpstream>,
    pub request_log: RequestLog,
    pub production: bool,
    pub max_request_bytes: usize,
    start_instant: Instant,
}

/// Build shared state from a parsed configuration.
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let upstream = OpenRouterClient::new(
        config.upstream_url.clone(),
        config.api_key.clone(),
        config.app_url.clone(),
        Duration::from_millis(config.upstream_timeout_ms),
    )
    .map_err(|e| anyhow::anyhow!("failed to build upstream client: {e}"))?;

    // Request log is best effort: a bad path disables it rather than aborting.
    let request_log = match config.log_file.as_deref() {
        Some(path) => match RotatingWriter::open(
            path,
            config.rotation.max_bytes,
            config.rotation.keep,
            config.rotation.compress,
        ) {
            Ok(writer) => RequestLog::new(Some(writer)),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE; request log disabled");
                RequestLog::disabled()
            }
        },
        None => RequestLog::disabled(),
    };

    Ok(AppState {
        allowed_models: Arc::new(config.allowed_models.clone()),
        allowed_origins: Arc::new(config.allowed_origins.clone()),
        csrf: Arc::new(CsrfStore::new(Duration::from_secs(config.csrf_token_ttl_secs))),
        limiter: Arc::new(SlidingWindowLimiter::new(
            Duration::from_secs(config.rate_limit_window_secs),
            config.rate_limit_max,
        )),
        upstream: Arc::new(upstream),
        request_log,
        production: config.production,
        max_request_bytes: config.max_request_bytes,
        start_instant: Instant::now(),
    })
}

/// Convenience wrapper: configuration from environment variables.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(&config)
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route(CHAT_PATH, post(chat_handler))
        .route("/api/csrf-token", get(csrf_token_handler))
        .route("/api/models", get(models_handler))
        .route("/api/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(state.max_request_bytes))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST];
    let headers = [header::CONTENT_TYPE, HeaderName::from_static(CSRF_HEADER)];
    if origins.is_empty() {
        tracing::warn!("CORS: allowing all origins (insecure for production)");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        tracing::info!(origins = ?origins, "CORS enabled");
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}

/// Request body for the proxy endpoint. Both fields stay raw JSON so the
/// validators can report type errors instead of a serde rejection.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Value,
    #[serde(default)]
    pub messages: Value,
}

fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({ "error": message, "code": code }))).into_response()
}

/// Prefer the first X-Forwarded-For hop when present, else the peer address.
fn client_ip(headers: &HeaderMap, peer: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Handler for `POST /api/chat`. Gate order: rate limit, CSRF, message
/// validation, model validation, upstream call. Every exit path records an
/// outcome to the request log.
async fn chat_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let ip = client_ip(&headers, &peer);
    tracing::info!(
        ip = %ip,
        user_agent = ?headers.get(header::USER_AGENT),
        body_size = ?headers.get(header::CONTENT_LENGTH),
        "chat request received"
    );

    let record = |outcome: &str, status: u16, model: Option<&str>, tokens: Option<u64>| {
        state.request_log.record(&RequestOutcome {
            ip: &ip,
            path: CHAT_PATH,
            outcome,
            status,
            latency_ms: started.elapsed().as_millis(),
            model,
            tokens_used: tokens,
        });
    };

    if let Err(exceeded) = state.limiter.check(&ip) {
        tracing::warn!(
            ip = %ip,
            path = CHAT_PATH,
            time = %Utc::now().to_rfc3339(),
            "rate limit exceeded"
        );
        record("RATE_LIMITED", 429, None, None);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many requests. Please try again later.",
                "retryAfter": exceeded.retry_after_secs,
            })),
        )
            .into_response();
    }

    let session = csrf::extract_cookie(&headers, csrf::SESSION_COOKIE);
    let token = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
    let csrf_ok = matches!(
        (session.as_deref(), token),
        (Some(sid), Some(tok)) if state.csrf.verify(sid, tok)
    );
    if !csrf_ok {
        tracing::warn!(ip = %ip, "CSRF verification failed");
        record("CSRF_INVALID", 403, None, None);
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Invalid CSRF token",
                "code": "CSRF_INVALID",
                "needRefresh": true,
            })),
        )
            .into_response();
    }

    let mut request = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => {
            let (status, message) = json_rejection_parts(&state, &rejection);
            record("SERVER_ERROR", status.as_u16(), None, None);
            return error_response(status, &message, "SERVER_ERROR");
        }
    };

    if let Err(reason) = validate::validate_messages(&mut request.messages) {
        tracing::warn!(ip = %ip, reason = %reason, "invalid messages");
        record("INVALID_MESSAGES", 400, None, None);
        return error_response(StatusCode::BAD_REQUEST, &reason, "INVALID_MESSAGES");
    }

    let model = match validate::validate_model(&request.model, &state.allowed_models) {
        Ok(model) => model,
        Err(reason) => {
            tracing::warn!(ip = %ip, reason = %reason, "invalid model");
            record("INVALID_MODEL", 400, None, None);
            return error_response(StatusCode::BAD_REQUEST, &reason, "INVALID_MODEL");
        }
    };

    let message_count = request.messages.as_array().map(Vec::len).unwrap_or(0);
    tracing::info!(model = %model, message_count, "request validated");

    match state.upstream.complete(&model, &request.messages).await {
        Ok(body) => {
            let tokens = body.pointer("/usage/total_tokens").and_then(Value::as_u64);
            tracing::info!(
                model = %model,
                duration_ms = started.elapsed().as_millis() as u64,
                tokens_used = ?tokens,
                "request completed"
            );
            record("ok", 200, Some(&model), tokens);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(UpstreamError::Status { status, detail }) => {
            // Upstream detail is logged but never leaked to the client.
            tracing::error!(status, detail = %detail, "upstream API error");
            record("API_ERROR", status, Some(&model), None);
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            error_response(status, "Failed to get AI response", "API_ERROR")
        }
        Err(err) => {
            tracing::error!(
                error = %err,
                duration_ms = started.elapsed().as_millis() as u64,
                "upstream call failed"
            );
            record("SERVER_ERROR", 500, Some(&model), None);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                "SERVER_ERROR",
            )
        }
    }
}

fn json_rejection_parts(state: &AppState, rejection: &JsonRejection) -> (StatusCode, String) {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(
                limit = state.max_request_bytes,
                "request body exceeded configured limit"
            );
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "Request too large (body exceeded limit {} bytes)",
                    state.max_request_bytes
                ),
            )
        }
        other => (StatusCode::BAD_REQUEST, other.body_text()),
    }
}

/// Handler for `GET /api/csrf-token`. Issues a token bound to the caller's
/// session cookie, minting the cookie first when the caller has none.
async fn csrf_token_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let existing = csrf::extract_cookie(&headers, csrf::SESSION_COOKIE);
    let (session_id, is_new) = match existing {
        Some(sid) => (sid, false),
        None => (csrf::new_session_id(), true),
    };
    let token = state.csrf.issue(&session_id);
    let mut response = Json(json!({
        "csrfToken": token,
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response();
    if is_new {
        let cookie = csrf::session_cookie(&session_id, state.production);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

async fn models_handler(State(state): State<AppState>) -> Response {
    let body = json!({
        "models": *state.allowed_models,
        "default": state.allowed_models.first(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// Simple health endpoint for readiness / liveness checks.
async fn health_handler(State(state): State<AppState>) -> Response {
    let body = json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.start_instant.elapsed().as_secs_f64(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found", "NOT_FOUND")
}
