use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{routing::post, Json, Router};
use chatgate::{build_state, AppConfig, RotationConfig};
use serde_json::{json, Value};

/// Configuration pointing at `upstream_url`, with limits loose enough that
/// individual tests only tighten what they exercise.
pub fn test_config(upstream_url: &str) -> AppConfig {
    AppConfig {
        api_key: "sk-test".to_string(),
        upstream_url: upstream_url.to_string(),
        app_url: "http://localhost:3001".to_string(),
        allowed_models: vec!["alpha/one:free".to_string(), "beta/two:free".to_string()],
        allowed_origins: Vec::new(),
        production: false,
        rate_limit_window_secs: 60,
        rate_limit_max: 1000,
        csrf_token_ttl_secs: 3600,
        max_request_bytes: 50 * 1024,
        upstream_timeout_ms: 2000,
        log_file: None,
        rotation: RotationConfig {
            max_bytes: None,
            keep: 1,
            compress: false,
        },
    }
}

/// Spawn the app bound to an ephemeral port, returning its base URL.
#[allow(dead_code)]
pub async fn spawn_app(config: AppConfig) -> String {
    let state = build_state(&config).expect("state should build");
    let app = chatgate::app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{}", addr)
}

/// Mock completion API answering every request with a fixed choices body.
/// Returns the full completions URL and a hit counter.
#[allow(dead_code)]
pub async fn spawn_mock_upstream() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let handler = move |Json(_body): Json<Value>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Hello from mock" } }],
                "usage": { "total_tokens": 13 },
            }))
        }
    };
    let app = Router::new().route("/v1/chat/completions", post(handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/v1/chat/completions", addr), hits)
}

/// Mock completion API that always fails with an upstream-style error body.
#[allow(dead_code)]
pub async fn spawn_failing_upstream() -> String {
    async fn fail(Json(_body): Json<Value>) -> (axum::http::StatusCode, Json<Value>) {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": "upstream exploded" } })),
        )
    }
    let app = Router::new().route("/v1/chat/completions", post(fail));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

/// Mock completion API answering 200 with a body that is not JSON.
#[allow(dead_code)]
pub async fn spawn_garbage_upstream() -> String {
    async fn garbage() -> &'static str {
        "ok, but not json"
    }
    let app = Router::new().route("/v1/chat/completions", post(garbage));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

/// Cookie-holding HTTP client plus a freshly issued CSRF token for it.
#[allow(dead_code)]
pub async fn client_with_token(base_url: &str) -> (reqwest::Client, String) {
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .unwrap();
    let body: Value = client
        .get(format!("{}/api/csrf-token", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = body["csrfToken"].as_str().unwrap().to_string();
    (client, token)
}
