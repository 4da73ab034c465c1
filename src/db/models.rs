//! Database row types for the chat schema.
//! These correspond 1:1 to the tables defined in migrations.rs.

use serde::Serialize;

/// Canonical stored chat message. The id and created_at fields are
/// assigned by the persistence layer, never by the client. Serialized
/// camelCase because the record travels verbatim inside `new_message`
/// frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: String,
    pub created_at: String,
}

/// Participant membership row: one user's role and read position in one
/// conversation.
#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub last_read_at: Option<String>,
    pub joined_at: String,
}

/// Conversation record in the chat_conversations table
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
}
