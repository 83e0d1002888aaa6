//! Presence registry: which users are reachable for real-time delivery.
//!
//! ```text
//! user_id ──► ConnectionHandle ──► mpsc outbox ──► WebSocket writer
//! ```
//!
//! The table is single-valued: one reachable endpoint per user. A newer
//! connection for the same user evicts the previous entry, and the evicted
//! handle is returned so the server can tell that connection it was
//! superseded. Absence of an entry means "not reachable right now" — the
//! user may still have unread persisted messages.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerEvent, UserId};

/// Handle to one live client connection.
///
/// The transport layer owns the socket; everything else only ever holds
/// this handle. Sends are non-blocking: a full or closed outbox drops the
/// frame (delivery is at-most-once, best-effort).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    outbox: mpsc::Sender<Arc<Vec<u8>>>,
}

impl ConnectionHandle {
    pub fn new(outbox: mpsc::Sender<Arc<Vec<u8>>>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            outbox,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Push a pre-encoded frame to this connection. Returns false if the
    /// frame was dropped (outbox full or connection gone).
    pub fn send_frame(&self, frame: Arc<Vec<u8>>) -> bool {
        match self.outbox.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbox full for connection {}, dropping frame", self.conn_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Encode and push a single event to this connection.
    pub fn send_event(&self, event: &ServerEvent) -> Result<bool, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        Ok(self.send_frame(frame))
    }
}

/// The process-wide presence table, lock-guarded and injected into every
/// component that needs it (never ambient state).
pub struct PresenceRegistry {
    entries: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a user's live connection.
    ///
    /// Overwrites any existing mapping and returns the evicted handle so
    /// the caller can notify the superseded connection.
    pub async fn register(&self, user: &UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut entries = self.entries.write().await;
        entries.insert(user.clone(), handle)
    }

    /// Look up the live connection for a user, if any.
    pub async fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.entries.read().await.get(user).cloned()
    }

    /// Remove the entry owned by the given connection.
    ///
    /// Removal is triggered by connection loss, so the key is the
    /// connection, not the user: scan for the entry whose handle matches
    /// and return the freed user id. A connection that was already
    /// superseded by a newer one finds no entry and removes nothing.
    pub async fn unregister(&self, conn_id: Uuid) -> Option<UserId> {
        let mut entries = self.entries.write().await;
        let user = entries
            .iter()
            .find(|(_, handle)| handle.conn_id() == conn_id)
            .map(|(user, _)| user.clone())?;
        entries.remove(&user);
        Some(user)
    }

    /// Snapshot of all currently-reachable user ids.
    pub async fn online_users(&self) -> Vec<UserId> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.entries.read().await.contains_key(user)
    }

    pub async fn online_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
