use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
/// WebSocket upgrade endpoint. Every socket is admitted unauthenticated;
/// conversation commands only work after the client sends an in-band
/// `auth` frame (the portal session already vouched for the user before
/// handing out the socket URL).
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    actor::run_connection(socket, state).await;
}
