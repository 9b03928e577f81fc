//! Client half of the system.
//!
//! [`ChatClient`] owns the anti-forgery token lifecycle against a running
//! proxy: fetch on demand, proactive refresh before expiry, and a single
//! transparent retry when the server signals an invalid token. [`ChatStore`]
//! persists recent conversations locally with the same sanitization rules the
//! server applies. [`ChatSession`] ties the two together as the explicit
//! state object a frontend drives.

mod csrf;
mod session;
mod store;

pub use csrf::{ChatClient, ClientError, TOKEN_REFRESH_INTERVAL};
pub use session::{ChatSession, SessionMode};
pub use store::{title_for, ChatStore, PersistedChat, StoreError, MAX_CHATS};
