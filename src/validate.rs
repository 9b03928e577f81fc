//! Shared validation and sanitization rules.
//!
//! Both boundaries consume this module: the HTTP handlers validate inbound
//! payloads with it, and the client chat store applies the same rules before
//! persisting anything locally. Keeping one copy guarantees the two sides
//! never drift on what counts as a well-formed conversation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of turns accepted in a single request.
pub const MAX_MESSAGES: usize = 50;
/// Maximum characters per turn.
pub const MAX_MESSAGE_LENGTH: usize = 5000;
/// Maximum characters summed across all turns.
pub const MAX_TOTAL_CHARS: usize = 30000;
/// Maximum characters in a sanitized chat id.
pub const MAX_CHAT_ID_LENGTH: usize = 100;

/// Roles a conversation turn may carry.
pub const VALID_ROLES: [&str; 3] = ["user", "assistant", "system"];

static SCRIPT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());

/// One role-tagged turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub fn is_valid_role(role: &str) -> bool {
    VALID_ROLES.contains(&role)
}

/// Strip embedded script tags and surrounding whitespace.
pub fn sanitize_content(content: &str) -> String {
    SCRIPT_TAG_RE.replace_all(content, "").trim().to_string()
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Escape a string for safe embedding in HTML output.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Reduce an untrusted chat id to the `[A-Za-z0-9_-]` charset, capped at
/// [`MAX_CHAT_ID_LENGTH`]. Returns `None` when nothing survives.
pub fn sanitize_chat_id(id: &str) -> Option<String> {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_CHAT_ID_LENGTH)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Validate and sanitize a raw `messages` value in place.
///
/// Structural failures (not an array, empty, too many turns, aggregate length
/// breach) short-circuit. Per-turn violations are collected so the caller
/// sees every problem at once, joined with `"; "`. Turn content is rewritten
/// with [`sanitize_content`]; the sanitized text is what goes upstream.
pub fn validate_messages(messages: &mut Value) -> Result<(), String> {
    let turns = match messages.as_array_mut() {
        Some(turns) => turns,
        None => return Err("Messages must be an array".to_string()),
    };
    if turns.is_empty() {
        return Err("Messages array cannot be empty".to_string());
    }
    if turns.len() > MAX_MESSAGES {
        return Err(format!(
            "Too many messages. Maximum {} allowed",
            MAX_MESSAGES
        ));
    }

    let mut errors = Vec::new();
    let mut total_chars = 0usize;
    for (i, turn) in turns.iter_mut().enumerate() {
        let obj = match turn.as_object_mut() {
            Some(obj) => obj,
            None => {
                errors.push(format!("Message {}: Invalid format", i));
                continue;
            }
        };
        let role_ok = obj
            .get("role")
            .and_then(Value::as_str)
            .map(is_valid_role)
            .unwrap_or(false);
        if !role_ok {
            errors.push(format!(
                "Message {}: Invalid role. Must be one of: {}",
                i,
                VALID_ROLES.join(", ")
            ));
        }
        let content = match obj.get("content").and_then(Value::as_str) {
            Some(content) => content.to_string(),
            None => {
                errors.push(format!("Message {}: Content must be a string", i));
                continue;
            }
        };
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            errors.push(format!(
                "Message {}: Content too long. Maximum {} characters",
                i, MAX_MESSAGE_LENGTH
            ));
        }
        let cleaned = sanitize_content(&content);
        if cleaned.is_empty() {
            errors.push(format!("Message {}: Content cannot be empty", i));
        }
        total_chars += cleaned.chars().count();
        obj.insert("content".to_string(), Value::String(cleaned));
    }

    if total_chars > MAX_TOTAL_CHARS {
        return Err(format!(
            "Total message length too long. Maximum {} characters",
            MAX_TOTAL_CHARS
        ));
    }
    if !errors.is_empty() {
        return Err(errors.join("; "));
    }
    Ok(())
}

/// Resolve the requested model against the allow-list.
///
/// Absent, null or empty requests fall back to the first allow-listed model.
pub fn validate_model(model: &Value, allowed: &[String]) -> Result<String, String> {
    let default = || {
        allowed
            .first()
            .cloned()
            .ok_or_else(|| "No models configured".to_string())
    };
    match model {
        Value::Null => default(),
        Value::String(s) if s.is_empty() => default(),
        Value::String(s) => {
            if allowed.iter().any(|m| m == s) {
                Ok(s.clone())
            } else {
                Err(format!(
                    "Invalid model. Allowed models: {}",
                    allowed.join(", ")
                ))
            }
        }
        _ => Err("Model must be a string".to_string()),
    }
}
