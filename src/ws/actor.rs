use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::protocol::{self, Session};

/// Ping interval: server sends a WebSocket ping every 30 seconds to
/// detect abrupt disconnects that would otherwise leak registry entries.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if no pong arrives within 10 seconds after a ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an admitted socket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from an mpsc channel
/// - Reader loop: decodes inbound frames and hands them to the dispatcher
///
/// The socket starts unauthenticated and stays that way until a
/// successful `auth` command registers it; once authenticated it remains
/// so for its entire lifetime. On close the actor removes the registry
/// entry, but only if the entry still belongs to this exact socket — a
/// newer login for the same user must survive an older socket's close
/// event.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let mut session = Session::new(state.registry.allocate_connection_id());

    tracing::debug!(
        connection_id = session.connection_id,
        "WebSocket actor started"
    );

    // Writer task: forwards mpsc messages to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: one command at a time, so persistence is always
    // awaited before the broadcast for that command
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_frame(text.as_str(), &tx, &mut session, &state).await;
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        connection_id = session.connection_id,
                        "Ignoring binary frame (protocol is JSON text)"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = session.connection_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(error)) => {
                tracing::warn!(
                    connection_id = session.connection_id,
                    %error,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(
                    connection_id = session.connection_id,
                    "WebSocket stream ended"
                );
                break;
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    // Deregister only if the registry entry still points at this socket.
    if let Some(user_id) = session.user_id.take() {
        let removed = state
            .registry
            .deregister_connection(&user_id, session.connection_id);
        tracing::info!(
            user_id = %user_id,
            connection_id = session.connection_id,
            removed,
            "WebSocket actor stopped"
        );
    } else {
        tracing::debug!(
            connection_id = session.connection_id,
            "WebSocket actor stopped (never authenticated)"
        );
    }
}

/// Writer task: receives messages from the mpsc channel and forwards them
/// to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
