//! Fan-out of server events to live sockets.
//!
//! Both paths are at-most-once, best-effort pushes: a participant who is
//! offline at send time never receives the payload over this channel
//! (they see it on their next full history fetch through the ordinary
//! read path). Nothing is queued or retried.

use axum::extract::ws::Message;

use super::protocol::ServerFrame;
use super::ConnectionRegistry;

/// Push a frame to every registry entry currently subscribed to
/// `conversation_id` whose socket is still open. Closed sockets are
/// skipped silently.
pub fn broadcast_to_conversation(
    registry: &ConnectionRegistry,
    conversation_id: &str,
    frame: &ServerFrame,
) {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(error) => {
            tracing::error!(%error, "Failed to encode broadcast frame");
            return;
        }
    };

    for (user_id, sender) in registry.subscribers(conversation_id) {
        if sender.send(Message::Text(text.clone().into())).is_err() {
            tracing::debug!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                "Skipped closed socket during broadcast"
            );
        }
    }
}

/// Direct notification channel: push a producer-defined payload to one
/// specific user if currently connected, otherwise do nothing. Used for
/// server-internal events outside any conversation.
pub fn notify_user(registry: &ConnectionRegistry, user_id: &str, payload: &serde_json::Value) {
    let Some(sender) = registry.sender_for(user_id) else {
        return;
    };
    let _ = sender.send(Message::Text(payload.to_string().into()));
}
