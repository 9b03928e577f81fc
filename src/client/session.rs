//! Explicit conversation session state.
//!
//! Replaces the ad hoc globals a frontend tends to grow (current chat id,
//! in-memory message list, view-mode flag) with one object whose transitions
//! happen only through defined operations.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::validate::ChatMessage;

use super::csrf::{ChatClient, ClientError};
use super::store::{title_for, ChatStore, PersistedChat};

/// Whether the session accepts new input or is replaying stored history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Active,
    ViewingHistory,
}

pub struct ChatSession {
    client: Arc<ChatClient>,
    store: ChatStore,
    chat_id: String,
    model: Option<String>,
    messages: Vec<ChatMessage>,
    mode: SessionMode,
}

impl ChatSession {
    /// A fresh session starts as a new, active chat.
    pub fn new(client: Arc<ChatClient>, store: ChatStore) -> Self {
        Self {
            client,
            store,
            chat_id: new_chat_id(),
            model: None,
            messages: Vec::new(),
            mode: SessionMode::Active,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Input controls are enabled only for an active chat.
    pub fn input_enabled(&self) -> bool {
        self.mode == SessionMode::Active
    }

    pub fn title(&self) -> String {
        title_for(&self.messages)
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    /// Start over with a fresh chat id and an empty transcript.
    pub fn new_chat(&mut self) {
        self.chat_id = new_chat_id();
        self.messages.clear();
        self.mode = SessionMode::Active;
    }

    /// Replace the transcript with a stored chat, read-only. Returns false
    /// when no valid chat exists under the (sanitized) id.
    pub fn load_chat(&mut self, id: &str) -> bool {
        match self.store.get(id) {
            Some(chat) => {
                self.chat_id = chat.id;
                self.model = Some(chat.model);
                self.messages = chat.messages;
                self.mode = SessionMode::ViewingHistory;
                true
            }
            None => false,
        }
    }

    /// Send one user turn through the proxy and append the assistant reply.
    ///
    /// The request is tagged with the chat id at send time; a reply that
    /// lands after the active chat changed is discarded rather than applied
    /// to the wrong transcript. A failed send leaves an assistant-style
    /// error turn in the transcript and propagates the error so the caller
    /// can re-enable input.
    pub async fn send(&mut self, content: &str) -> Result<String, ClientError> {
        if self.mode != SessionMode::Active {
            return Err(ClientError::Api {
                code: "VIEW_ONLY".to_string(),
                message: "history view is read-only, start a new chat to send".to_string(),
            });
        }
        self.messages.push(ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
        });

        let issued_for = self.chat_id.clone();
        let result = self
            .client
            .send_chat(self.model.as_deref(), &self.messages)
            .await;
        if self.chat_id != issued_for {
            return Err(ClientError::StaleResponse);
        }

        match result {
            Ok(body) => {
                let reply = body
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: reply.clone(),
                });
                self.persist_current();
                Ok(reply)
            }
            Err(err) => {
                self.messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: format!("Error: {}", err),
                });
                Err(err)
            }
        }
    }

    fn persist_current(&self) {
        let chat = PersistedChat {
            id: self.chat_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            model: self.model.clone().unwrap_or_default(),
            messages: self.messages.clone(),
        };
        if let Err(err) = self.store.save(&chat) {
            tracing::warn!(error = %err, chat_id = %self.chat_id, "failed to persist chat");
        }
    }
}

fn new_chat_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
