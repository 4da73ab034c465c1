use std::sync::Arc;

use crate::store::SharedChatStore;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via the axum State
/// extractor. The registry is an explicit, injectable object (not a
/// module global) so tests can construct and inspect it directly.
#[derive(Clone)]
pub struct AppState {
    /// Persistence gateway for messages and memberships
    pub store: SharedChatStore,
    /// Live WebSocket connections, at most one entry per user
    pub registry: Arc<ConnectionRegistry>,
}
