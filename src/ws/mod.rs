pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push frames to a specific
/// client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// One live client session: the socket's outbound handle plus the set of
/// conversations the user is known to participate in. The conversation
/// set is a snapshot taken at authentication time and is extended only
/// by explicit join commands.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Socket identity compared by the close-ordering guard.
    pub connection_id: u64,
    pub sender: ConnectionSender,
    pub conversation_ids: HashSet<String>,
}

/// Registry of live connections, at most one entry per user identity.
/// A duplicate login replaces the previous entry — the latest connection
/// wins, and the replaced sender is unreachable through registry lookups
/// from that point on.
///
/// Registry mutations come from the dispatcher and the connection actor;
/// the broadcast router and direct notification channel only read.
pub struct ConnectionRegistry {
    entries: DashMap<String, ConnectionEntry>,
    next_connection_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Hand out the socket identity used by the close-ordering guard.
    /// Assigned once per socket at admission time.
    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace the entry for `user_id`. Overwriting is the
    /// defined behavior for duplicate logins.
    pub fn register(
        &self,
        user_id: &str,
        connection_id: u64,
        sender: ConnectionSender,
        conversation_ids: HashSet<String>,
    ) {
        self.entries.insert(
            user_id.to_string(),
            ConnectionEntry {
                connection_id,
                sender,
                conversation_ids,
            },
        );
    }

    /// Add a conversation to the user's subscription set. No-op when the
    /// user has no live entry (the command arrived before or without
    /// authentication).
    pub fn add_conversation(&self, user_id: &str, conversation_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            entry.conversation_ids.insert(conversation_id.to_string());
        }
    }

    /// Remove the entry for `user_id`. Idempotent.
    pub fn deregister(&self, user_id: &str) {
        self.entries.remove(user_id);
    }

    /// Guarded removal: an older socket's close event must not evict a
    /// newer login for the same user, so the entry is removed only if it
    /// still carries `connection_id`. Returns whether an entry was
    /// removed.
    pub fn deregister_connection(&self, user_id: &str, connection_id: u64) -> bool {
        self.entries
            .remove_if(user_id, |_, entry| entry.connection_id == connection_id)
            .is_some()
    }

    /// Entries currently subscribed to `conversation_id`. Recomputed on
    /// each call — membership sets are small and fan-out is infrequent
    /// enough that a reverse index isn't worth maintaining.
    pub fn subscribers(&self, conversation_id: &str) -> Vec<(String, ConnectionSender)> {
        self.entries
            .iter()
            .filter(|entry| entry.conversation_ids.contains(conversation_id))
            .map(|entry| (entry.key().clone(), entry.sender.clone()))
            .collect()
    }

    /// The single entry for `user_id`, if currently connected.
    pub fn sender_for(&self, user_id: &str) -> Option<ConnectionSender> {
        self.entries.get(user_id).map(|entry| entry.sender.clone())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
