//! Server-side CSRF token management.
//!
//! Tokens are bound to a session cookie: each session id maps to exactly one
//! live token with a fixed validity window. A state-mutating request must
//! present the token for its own session; anything else is rejected so the
//! client can refresh and retry.

use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use dashmap::DashMap;

/// Name of the session cookie the token is bound to.
pub const SESSION_COOKIE: &str = "sid";

/// Session cookie lifetime in seconds.
pub const SESSION_MAX_AGE_SECS: u64 = 86_400;

struct IssuedToken {
    token: String,
    issued_at: Instant,
}

/// In-memory token store keyed by session id. Lives for the duration of the
/// server process; there is no cross-process coordination.
pub struct CsrfStore {
    tokens: DashMap<String, IssuedToken>,
    ttl: Duration,
}

impl CsrfStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh token for `session_id`, replacing any previous one.
    /// Expired entries from other sessions are pruned on the way.
    pub fn issue(&self, session_id: &str) -> String {
        let ttl = self.ttl;
        self.tokens.retain(|_, t| t.issued_at.elapsed() < ttl);
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(
            session_id.to_string(),
            IssuedToken {
                token: token.clone(),
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// True only for a matching, unexpired token.
    pub fn verify(&self, session_id: &str, presented: &str) -> bool {
        match self.tokens.get(session_id) {
            Some(entry) => entry.issued_at.elapsed() < self.ttl && entry.token == presented,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Pull a cookie value by name out of the request headers.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some(rest) = pair.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Render the Set-Cookie value for a new session. HttpOnly and SameSite=Strict
/// always; Secure only under a production environment so local development
/// over plain HTTP keeps working.
pub fn session_cookie(session_id: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE, session_id, SESSION_MAX_AGE_SECS
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
