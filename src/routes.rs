use axum::Router;

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router. The chat delivery service exposes a single
/// WebSocket endpoint plus a health check; the portal's REST resources
/// live in a separate service.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler::ws_upgrade))
        .route("/health", axum::routing::get(health_check))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
