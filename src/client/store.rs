//! Local chat persistence.
//!
//! The store is a single JSON array of [`PersistedChat`] at a caller-supplied
//! path, read-modify-written as a whole on every mutation. Callers must treat
//! each mutation as one critical section; two processes racing on the same
//! file can lose updates. Nothing here ever reaches the server.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validate::{
    self, ChatMessage, MAX_CHAT_ID_LENGTH, MAX_MESSAGES, MAX_MESSAGE_LENGTH,
};

/// Capacity bound: the oldest chats are evicted beyond this.
pub const MAX_CHATS: usize = 300;

/// Display-label bound for the stored model name. The label is not
/// re-validated against the server allow-list on read.
pub const MAX_MODEL_LABEL: usize = 200;

const TITLE_LIMIT: usize = 50;
const FALLBACK_TITLE: &str = "New chat";
const FALLBACK_MODEL: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat failed sanitization and cannot be stored")]
    InvalidChat,
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One locally persisted conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedChat {
    pub id: String,
    /// Milliseconds since the epoch; refreshed on every successful exchange.
    pub timestamp: i64,
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl PersistedChat {
    /// Structural invariants every stored entry must satisfy.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        validate::sanitize_chat_id(&self.id).as_deref() == Some(self.id.as_str())
            && self.id.len() <= MAX_CHAT_ID_LENGTH
            && self.timestamp > 0
            && self.timestamp <= now_ms
            && self.model.chars().count() <= MAX_MODEL_LABEL
            && !self.messages.is_empty()
            && self.messages.len() <= MAX_MESSAGES
            && self.messages.iter().all(|m| {
                validate::is_valid_role(&m.role)
                    && !m.content.is_empty()
                    && m.content.chars().count() <= MAX_MESSAGE_LENGTH
            })
    }

    /// Produce a sanitized copy, or `None` when no valid id or messages
    /// survive sanitization.
    fn sanitized(&self, now_ms: i64) -> Option<PersistedChat> {
        let id = validate::sanitize_chat_id(&self.id)?;
        let messages: Vec<ChatMessage> = self
            .messages
            .iter()
            .take(MAX_MESSAGES)
            .map(|m| ChatMessage {
                role: if validate::is_valid_role(&m.role) {
                    m.role.clone()
                } else {
                    "user".to_string()
                },
                content: validate::truncate_chars(
                    &validate::sanitize_content(&m.content),
                    MAX_MESSAGE_LENGTH,
                ),
            })
            .collect();
        if messages.is_empty() {
            return None;
        }
        let model = if self.model.is_empty() {
            FALLBACK_MODEL.to_string()
        } else {
            validate::truncate_chars(&self.model, MAX_MODEL_LABEL)
        };
        Some(PersistedChat {
            id,
            timestamp: self.timestamp.clamp(0, now_ms),
            model,
            messages,
        })
    }
}

/// Display title for a conversation: up to 50 characters of the first user
/// turn with angle brackets stripped, always HTML-escaped.
pub fn title_for(messages: &[ChatMessage]) -> String {
    let Some(first_user) = messages.iter().find(|m| m.role == "user") else {
        return FALLBACK_TITLE.to_string();
    };
    let stripped: String = first_user
        .content
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect();
    let mut title: String = stripped.chars().take(TITLE_LIMIT).collect();
    if stripped.chars().count() > TITLE_LIMIT {
        title.push_str("...");
    }
    validate::escape_html(&title)
}

pub struct ChatStore {
    path: PathBuf,
}

impl ChatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// All structurally valid stored chats, in insertion order (oldest
    /// first). An unreadable or non-array payload discards everything;
    /// individual invalid entries are silently dropped, not repaired.
    pub fn list(&self) -> Vec<PersistedChat> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(_) => return Vec::new(),
        };
        let Value::Array(items) = parsed else {
            return Vec::new();
        };
        let now_ms = Utc::now().timestamp_millis();
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<PersistedChat>(item).ok())
            .filter(|chat| chat.is_valid(now_ms))
            .collect()
    }

    /// Sanitize and upsert one chat, evicting the oldest entries when the
    /// store is at capacity. Returns the sanitized record as written.
    pub fn save(&self, chat: &PersistedChat) -> Result<PersistedChat, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let clean = chat.sanitized(now_ms).ok_or(StoreError::InvalidChat)?;
        if !clean.is_valid(now_ms) {
            return Err(StoreError::InvalidChat);
        }

        let mut chats = self.list();
        let exists = chats.iter().any(|c| c.id == clean.id);
        if !exists && chats.len() >= MAX_CHATS {
            // Oldest entries live at the front; free exactly enough room.
            let surplus = chats.len() - MAX_CHATS + 1;
            chats.drain(..surplus);
        }
        match chats.iter_mut().find(|c| c.id == clean.id) {
            Some(existing) => *existing = clean.clone(),
            None => chats.push(clean.clone()),
        }
        self.persist(&chats)?;
        Ok(clean)
    }

    /// Fetch by (sanitized) id; entries failing structural validation are
    /// treated as absent.
    pub fn get(&self, id: &str) -> Option<PersistedChat> {
        let id = validate::sanitize_chat_id(id)?;
        self.list().into_iter().find(|c| c.id == id)
    }

    /// Remove by (sanitized) id. Returns whether a removal occurred.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(id) = validate::sanitize_chat_id(id) else {
            return Ok(false);
        };
        let mut chats = self.list();
        let before = chats.len();
        chats.retain(|c| c.id != id);
        let removed = chats.len() != before;
        if removed {
            self.persist(&chats)?;
        }
        Ok(removed)
    }

    fn persist(&self, chats: &[PersistedChat]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string(chats)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ChatStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::new(dir.path().join("chats.json"));
        (dir, store)
    }

    fn chat(id: &str) -> PersistedChat {
        PersistedChat {
            id: id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            model: "alpha/one:free".to_string(),
            messages: vec![
                ChatMessage {
                    role: "user".to_string(),
                    content: "hello there".to_string(),
                },
                ChatMessage {
                    role: "assistant".to_string(),
                    content: "hi".to_string(),
                },
            ],
        }
    }

    #[test]
    fn save_then_get_roundtrip() {
        let (_dir, store) = store();
        let saved = store.save(&chat("abc-123")).unwrap();
        assert_eq!(store.get("abc-123").unwrap(), saved);
    }

    #[test]
    fn resaving_a_sanitized_chat_is_idempotent() {
        let (_dir, store) = store();
        let first = store.save(&chat("abc-123")).unwrap();
        let second = store.save(&first).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn get_and_delete_use_the_sanitized_id() {
        let (_dir, store) = store();
        store.save(&chat("abc-123")).unwrap();
        // The raw id differs, the sanitized one matches the stored record.
        assert!(store.get("abc<>-123").is_some());
        assert!(store.delete("abc!!-123").unwrap());
        assert!(store.get("abc-123").is_none());
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let (_dir, store) = store();
        store.save(&chat("abc")).unwrap();
        assert!(store.delete("abc").unwrap());
        assert!(!store.delete("abc").unwrap());
        assert!(!store.delete("<<<>>>").unwrap());
    }

    #[test]
    fn save_sanitizes_messages_and_model() {
        let (_dir, store) = store();
        let mut dirty = chat("abc");
        dirty.messages[0].content = "hi <script>alert(1)</script>".to_string();
        dirty.messages[1].role = "wizard".to_string();
        dirty.model = "m".repeat(MAX_MODEL_LABEL + 50);
        let saved = store.save(&dirty).unwrap();
        assert_eq!(saved.messages[0].content, "hi");
        assert_eq!(saved.messages[1].role, "user");
        assert_eq!(saved.model.len(), MAX_MODEL_LABEL);
    }

    #[test]
    fn save_rejects_unusable_ids_and_empty_messages() {
        let (_dir, store) = store();
        let mut bad_id = chat("<<<>>>");
        assert!(matches!(
            store.save(&bad_id),
            Err(StoreError::InvalidChat)
        ));
        bad_id.id = "ok".to_string();
        bad_id.messages.clear();
        assert!(matches!(
            store.save(&bad_id),
            Err(StoreError::InvalidChat)
        ));
    }

    #[test]
    fn future_timestamps_are_clamped_to_now() {
        let (_dir, store) = store();
        let mut future = chat("abc");
        future.timestamp = Utc::now().timestamp_millis() + 86_400_000;
        let saved = store.save(&future).unwrap();
        assert!(saved.timestamp <= Utc::now().timestamp_millis());
        assert!(store.get("abc").is_some());
    }

    #[test]
    fn capacity_evicts_oldest_entries_first() {
        let (_dir, store) = store();
        for i in 0..MAX_CHATS {
            store.save(&chat(&format!("chat-{i}"))).unwrap();
        }
        assert_eq!(store.list().len(), MAX_CHATS);

        store.save(&chat("one-more")).unwrap();
        let chats = store.list();
        assert_eq!(chats.len(), MAX_CHATS);
        assert!(chats.iter().all(|c| c.id != "chat-0"));
        assert!(chats.iter().any(|c| c.id == "one-more"));
    }

    #[test]
    fn upsert_at_capacity_does_not_evict() {
        let (_dir, store) = store();
        for i in 0..MAX_CHATS {
            store.save(&chat(&format!("chat-{i}"))).unwrap();
        }
        store.save(&chat("chat-5")).unwrap();
        let chats = store.list();
        assert_eq!(chats.len(), MAX_CHATS);
        assert!(chats.iter().any(|c| c.id == "chat-0"));
    }

    #[test]
    fn list_discards_corrupt_payloads_entirely() {
        let (_dir, store) = store();
        fs::write(&store.path, "not json at all").unwrap();
        assert!(store.list().is_empty());
        fs::write(&store.path, r#"{"not":"an array"}"#).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn list_drops_invalid_entries_silently() {
        let (_dir, store) = store();
        let good = store.save(&chat("good")).unwrap();
        let mut raw: Vec<Value> = vec![serde_json::to_value(&good).unwrap()];
        raw.push(serde_json::json!({"id": "bad!", "timestamp": -5}));
        raw.push(serde_json::json!({
            "id": "future",
            "timestamp": Utc::now().timestamp_millis() + 86_400_000,
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
        }));
        fs::write(&store.path, serde_json::to_string(&raw).unwrap()).unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");
    }

    #[test]
    fn titles_come_from_the_first_user_turn() {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: "be nice".to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: "what is <b>bold</b> text?".to_string(),
            },
        ];
        assert_eq!(title_for(&messages), "what is bbold/b text?");
    }

    #[test]
    fn long_titles_are_truncated_with_ellipsis() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: "z".repeat(80),
        }];
        let title = title_for(&messages);
        assert!(title.starts_with(&"z".repeat(50)));
        assert!(title.ends_with("..."));
    }

    #[test]
    fn missing_user_turn_yields_placeholder() {
        let messages = vec![ChatMessage {
            role: "assistant".to_string(),
            content: "hello".to_string(),
        }];
        assert_eq!(title_for(&messages), FALLBACK_TITLE);
        assert_eq!(title_for(&[]), FALLBACK_TITLE);
    }

    #[test]
    fn titles_are_html_escaped() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: "tom & \"jerry\"".to_string(),
        }];
        assert_eq!(title_for(&messages), "tom &amp; &quot;jerry&quot;");
    }
}
