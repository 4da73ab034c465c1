//! SQLite-backed implementation of the persistence gateway.

use chrono::{SecondsFormat, Utc};

use crate::db::models::{ChatMessage, ConversationRow, ParticipantRow};
use crate::db::DbPool;

use super::{ChatStore, NewChatMessage, StoreError};

/// Persistence gateway over the shared SQLite connection. Each method
/// holds the connection mutex for one statement or a short statement
/// sequence; async callers are expected to run them under
/// `tokio::task::spawn_blocking`.
pub struct SqliteChatStore {
    db: DbPool,
}

impl SqliteChatStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

/// Creation timestamps are assigned here, not by the client. Millisecond
/// precision keeps insertion order and timestamp order aligned for
/// ordinary traffic.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ChatStore for SqliteChatStore {
    fn create_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let conversation_exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM chat_conversations WHERE id = ?1",
            rusqlite::params![message.conversation_id],
            |row| row.get::<_, i64>(0).map(|count| count > 0),
        )?;
        if !conversation_exists {
            return Err(StoreError::UnknownConversation(message.conversation_id));
        }

        let record = ChatMessage {
            id: uuid::Uuid::now_v7().to_string(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            content: message.content,
            message_type: message.message_type,
            created_at: now_rfc3339(),
        };

        conn.execute(
            "INSERT INTO chat_messages (id, conversation_id, sender_id, sender_name, content, message_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.id,
                record.conversation_id,
                record.sender_id,
                record.sender_name,
                record.content,
                record.message_type,
                record.created_at,
            ],
        )?;

        Ok(record)
    }

    fn conversations_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM chat_participants WHERE user_id = ?1 ORDER BY joined_at",
        )?;
        let ids = stmt
            .query_map(rusqlite::params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn update_last_read_at(&self, user_id: &str, conversation_id: &str) -> Result<(), StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        // Zero rows updated means the membership does not exist; mark_read
        // is fire-and-forget, so that is not an error.
        conn.execute(
            "UPDATE chat_participants SET last_read_at = ?1 WHERE user_id = ?2 AND conversation_id = ?3",
            rusqlite::params![now_rfc3339(), user_id, conversation_id],
        )?;

        Ok(())
    }

    fn create_conversation(&self, title: Option<&str>) -> Result<String, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let id = uuid::Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO chat_conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, title, now_rfc3339()],
        )?;

        Ok(id)
    }

    fn add_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<(), StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        conn.execute(
            "INSERT OR IGNORE INTO chat_participants (conversation_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![conversation_id, user_id, role, now_rfc3339()],
        )?;

        Ok(())
    }

    fn participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRow>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let row = conn
            .query_row(
                "SELECT conversation_id, user_id, role, last_read_at, joined_at
                 FROM chat_participants WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![conversation_id, user_id],
                |row| {
                    Ok(ParticipantRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        role: row.get(2)?,
                        last_read_at: row.get(3)?,
                        joined_at: row.get(4)?,
                    })
                },
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(row)
    }

    fn conversation(&self, conversation_id: &str) -> Result<Option<ConversationRow>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let row = conn
            .query_row(
                "SELECT id, title, created_at FROM chat_conversations WHERE id = ?1",
                rusqlite::params![conversation_id],
                |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(row)
    }
}
