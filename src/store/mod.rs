//! Message persistence gateway.
//!
//! The fan-out layer treats storage as a collaborator behind the
//! `ChatStore` trait: durably append a message and hand back the
//! canonical stored record, fetch a user's conversation memberships at
//! authentication time, and write through last-read updates. Methods are
//! synchronous (rusqlite is); the WebSocket side runs them under
//! `tokio::task::spawn_blocking`.

mod sqlite;

pub use sqlite::SqliteChatStore;

use std::sync::Arc;

use crate::db::models::{ChatMessage, ConversationRow, ParticipantRow};

/// Shared handle to the persistence gateway. A trait object so tests can
/// substitute a rejecting gateway for failure-containment scenarios.
pub type SharedChatStore = Arc<dyn ChatStore>;

/// Input fields for a message append. Identity and creation timestamp
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: String,
}

/// Errors surfaced by the persistence gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
}

/// Storage contract consumed by the dispatcher and lifecycle code.
pub trait ChatStore: Send + Sync {
    /// Durably append a chat message and return the canonical stored
    /// record, including the server-assigned id and timestamp.
    fn create_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError>;

    /// Conversation identities the user participates in, fetched once at
    /// authentication time. The in-memory snapshot is not refreshed on
    /// later membership changes except via explicit join commands.
    fn conversations_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// Write through the per-participant last-read marker. Updating a
    /// membership that does not exist is a no-op.
    fn update_last_read_at(&self, user_id: &str, conversation_id: &str) -> Result<(), StoreError>;

    /// Create a conversation, returning its id.
    fn create_conversation(&self, title: Option<&str>) -> Result<String, StoreError>;

    /// Add a user to a conversation. Adding an existing participant
    /// leaves the original row untouched.
    fn add_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<(), StoreError>;

    /// Look up one membership row.
    fn participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRow>, StoreError>;

    /// Look up one conversation record.
    fn conversation(&self, conversation_id: &str) -> Result<Option<ConversationRow>, StoreError>;
}
