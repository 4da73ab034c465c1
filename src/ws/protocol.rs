//! Wire protocol and inbound command dispatch.
//!
//! Frames are UTF-8 JSON objects tagged by a mandatory `type` field, with
//! camelCase payload keys. Malformed frames and unknown tags are logged
//! and dropped without closing the connection; every command's failures
//! stay contained to that command.

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::db::models::ChatMessage;
use crate::state::AppState;
use crate::store::NewChatMessage;
use crate::ws::broadcast;

const NOT_AUTHENTICATED: &str = "Not authenticated";

/// Commands a client may send. This set is closed — anything else fails
/// to decode and is swallowed by the dispatcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Auth { user_id: String },

    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: String },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: String,
        sender_name: String,
        content: String,
        message_type: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    MarkRead { conversation_id: String },
}

/// Frames the server sends back over the same socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthSuccess,
    Error { message: String },
    NewMessage { message: ChatMessage },
}

/// Per-socket state owned by the connection actor. `user_id` is set by a
/// successful `auth` command; there is no transition back to
/// unauthenticated, though a later `auth` may re-associate the socket
/// with a different user.
#[derive(Debug)]
pub struct Session {
    pub connection_id: u64,
    pub user_id: Option<String>,
}

impl Session {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            user_id: None,
        }
    }
}

/// Decode one inbound text frame and route it to its handler.
pub async fn handle_text_frame(
    text: &str,
    tx: &mpsc::UnboundedSender<Message>,
    session: &mut Session,
    state: &AppState,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(
                connection_id = session.connection_id,
                %error,
                "Discarding malformed frame"
            );
            return;
        }
    };

    match frame {
        ClientFrame::Auth { user_id } => handle_auth(user_id, tx, session, state).await,
        ClientFrame::JoinConversation { conversation_id } => {
            handle_join_conversation(conversation_id, tx, session, state);
        }
        ClientFrame::SendMessage {
            conversation_id,
            sender_name,
            content,
            message_type,
        } => {
            handle_send_message(
                conversation_id,
                sender_name,
                content,
                message_type,
                tx,
                session,
                state,
            )
            .await;
        }
        ClientFrame::MarkRead { conversation_id } => {
            handle_mark_read(conversation_id, tx, session, state).await;
        }
    }
}

/// `auth`: snapshot the user's conversation memberships from the store,
/// register the socket, acknowledge. A fetch failure is logged and leaves
/// the socket open but unauthenticated, with no reply and no retry.
async fn handle_auth(
    user_id: String,
    tx: &mpsc::UnboundedSender<Message>,
    session: &mut Session,
    state: &AppState,
) {
    let store = state.store.clone();
    let lookup_user = user_id.clone();
    let memberships =
        tokio::task::spawn_blocking(move || store.conversations_for_user(&lookup_user)).await;

    let conversation_ids = match memberships {
        Ok(Ok(ids)) => ids,
        Ok(Err(error)) => {
            tracing::error!(user_id = %user_id, %error, "Membership fetch failed during auth");
            return;
        }
        Err(error) => {
            tracing::error!(user_id = %user_id, %error, "Membership fetch task failed");
            return;
        }
    };

    // Re-authenticating as a different user releases this socket's
    // previous registration. The guard keeps a newer login for the old
    // user intact.
    if let Some(previous) = session.user_id.take() {
        if previous != user_id {
            state
                .registry
                .deregister_connection(&previous, session.connection_id);
        }
    }

    state.registry.register(
        &user_id,
        session.connection_id,
        tx.clone(),
        conversation_ids.into_iter().collect(),
    );
    session.user_id = Some(user_id.clone());

    tracing::info!(
        user_id = %user_id,
        connection_id = session.connection_id,
        "WebSocket authenticated"
    );
    send_frame(tx, &ServerFrame::AuthSuccess);
}

/// `join_conversation`: extend the subscription snapshot. No
/// acknowledgement frame.
fn handle_join_conversation(
    conversation_id: String,
    tx: &mpsc::UnboundedSender<Message>,
    session: &Session,
    state: &AppState,
) {
    let Some(user_id) = session.user_id.as_deref() else {
        send_frame(
            tx,
            &ServerFrame::Error {
                message: NOT_AUTHENTICATED.to_string(),
            },
        );
        return;
    };

    state.registry.add_conversation(user_id, &conversation_id);
    tracing::debug!(user_id, conversation_id = %conversation_id, "Joined conversation");
}

/// `send_message`: persist first, then fan out the full stored record.
/// The broadcast carries the server-assigned id and timestamp, not the
/// client-supplied fields. A failed persist produces no frame at all —
/// no broadcast, no error to the sender.
async fn handle_send_message(
    conversation_id: String,
    sender_name: String,
    content: String,
    message_type: Option<String>,
    tx: &mpsc::UnboundedSender<Message>,
    session: &Session,
    state: &AppState,
) {
    let Some(user_id) = session.user_id.clone() else {
        send_frame(
            tx,
            &ServerFrame::Error {
                message: NOT_AUTHENTICATED.to_string(),
            },
        );
        return;
    };

    let store = state.store.clone();
    let new_message = NewChatMessage {
        conversation_id: conversation_id.clone(),
        sender_id: user_id.clone(),
        sender_name,
        content,
        message_type: message_type.unwrap_or_else(|| "text".to_string()),
    };

    let persisted =
        tokio::task::spawn_blocking(move || store.create_chat_message(new_message)).await;

    match persisted {
        Ok(Ok(message)) => {
            broadcast::broadcast_to_conversation(
                &state.registry,
                &conversation_id,
                &ServerFrame::NewMessage { message },
            );
        }
        Ok(Err(error)) => {
            tracing::error!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                %error,
                "Failed to persist chat message"
            );
        }
        Err(error) => {
            tracing::error!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                %error,
                "Persistence task failed"
            );
        }
    }
}

/// `mark_read`: write through the last-read marker. Never acknowledged.
async fn handle_mark_read(
    conversation_id: String,
    tx: &mpsc::UnboundedSender<Message>,
    session: &Session,
    state: &AppState,
) {
    let Some(user_id) = session.user_id.clone() else {
        send_frame(
            tx,
            &ServerFrame::Error {
                message: NOT_AUTHENTICATED.to_string(),
            },
        );
        return;
    };

    let store = state.store.clone();
    let cid = conversation_id.clone();
    let uid = user_id.clone();
    let result = tokio::task::spawn_blocking(move || store.update_last_read_at(&uid, &cid)).await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::error!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                %error,
                "Failed to update last-read marker"
            );
        }
        Err(error) => {
            tracing::error!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                %error,
                "Last-read task failed"
            );
        }
    }
}

/// Encode and send a frame as a text WebSocket message.
fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(error) => {
            tracing::error!(%error, "Failed to encode outbound frame");
        }
    }
}
