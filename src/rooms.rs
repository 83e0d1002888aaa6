//! Conversation groups: room-scoped fan-out to live connections.
//!
//! ```text
//! Conn A ──┐
//!           ├── ConversationGroup ("c1") ── broadcast ──► members' outboxes
//! Conn B ──┘
//! ```
//!
//! Each conversation id maps to one group; a connection joins every group
//! for the conversations its user participates in. Membership is recomputed
//! from the repository at identify time and only mutated explicitly
//! afterwards (group creation, disconnect). Fan-out snapshots the member
//! list under the lock and sends outside it, so a broadcast never misses a
//! just-added member or delivers to a just-removed one.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::protocol::{ConversationId, ConversationInfo, ProtocolError, ServerEvent, UserId};
use crate::repository::{ChatRepository, RepositoryError};

/// One connection's membership record in a group.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub user_id: UserId,
    pub handle: ConnectionHandle,
}

/// The broadcast set of connections subscribed to one conversation.
pub struct ConversationGroup {
    members: RwLock<HashMap<Uuid, GroupMember>>,
}

impl ConversationGroup {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_member(&self, user_id: UserId, handle: ConnectionHandle) {
        let mut members = self.members.write().await;
        members.insert(handle.conn_id(), GroupMember { user_id, handle });
    }

    pub async fn remove_member(&self, conn_id: Uuid) -> Option<GroupMember> {
        self.members.write().await.remove(&conn_id)
    }

    pub async fn has_conn(&self, conn_id: Uuid) -> bool {
        self.members.read().await.contains_key(&conn_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of the members, for presence scoping and tests.
    pub async fn members(&self) -> Vec<GroupMember> {
        self.members.read().await.values().cloned().collect()
    }

    /// Fan a pre-encoded frame out to every member, optionally skipping one
    /// connection (the originator). Returns the number of outboxes reached.
    pub async fn broadcast_frame(&self, frame: Arc<Vec<u8>>, skip: Option<Uuid>) -> usize {
        let targets: Vec<ConnectionHandle> = {
            let members = self.members.read().await;
            members
                .values()
                .filter(|m| Some(m.handle.conn_id()) != skip)
                .map(|m| m.handle.clone())
                .collect()
        };

        let mut delivered = 0;
        for handle in targets {
            if handle.send_frame(frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Encode once, then fan out.
    pub async fn broadcast_event(
        &self,
        event: &ServerEvent,
        skip: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        Ok(self.broadcast_frame(frame, skip).await)
    }
}

impl Default for ConversationGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Room registry: maps conversation ids to their broadcast groups.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<ConversationId, Arc<ConversationGroup>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the group for a conversation.
    pub async fn get_or_create(&self, conversation: &ConversationId) -> Arc<ConversationGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(conversation) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(conversation) {
            return room.clone();
        }
        let room = Arc::new(ConversationGroup::new());
        rooms.insert(conversation.clone(), room.clone());
        room
    }

    pub async fn get(&self, conversation: &ConversationId) -> Option<Arc<ConversationGroup>> {
        self.rooms.read().await.get(conversation).cloned()
    }

    /// Remove a connection from one group, dropping the group if empty.
    pub async fn leave(&self, conversation: &ConversationId, conn_id: Uuid) {
        let room = match self.get(conversation).await {
            Some(room) => room,
            None => return,
        };
        room.remove_member(conn_id).await;
        if room.member_count().await == 0 {
            let mut rooms = self.rooms.write().await;
            // Re-check under the write lock; someone may have re-joined.
            if let Some(current) = rooms.get(conversation) {
                if Arc::ptr_eq(current, &room) && current.member_count().await == 0 {
                    rooms.remove(conversation);
                }
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// All members sharing at least one of the given conversations,
    /// deduplicated by connection, excluding `except_conn`. Used to scope
    /// presence announcements to actually-related peers.
    pub async fn members_sharing(
        &self,
        conversations: &[ConversationId],
        except_conn: Uuid,
    ) -> Vec<GroupMember> {
        let mut seen: HashMap<Uuid, GroupMember> = HashMap::new();
        for conversation in conversations {
            if let Some(room) = self.get(conversation).await {
                for member in room.members().await {
                    if member.handle.conn_id() != except_conn {
                        seen.entry(member.handle.conn_id()).or_insert(member);
                    }
                }
            }
        }
        seen.into_values().collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads a user's conversation memberships and wires the connection into
/// the matching groups.
pub struct MembershipManager {
    repo: Arc<dyn ChatRepository>,
    rooms: Arc<RoomRegistry>,
}

impl MembershipManager {
    pub fn new(repo: Arc<dyn ChatRepository>, rooms: Arc<RoomRegistry>) -> Self {
        Self { repo, rooms }
    }

    /// Join the connection to every conversation the user participates in.
    ///
    /// This is a storage round-trip and runs inside the identify handler,
    /// so the connection's own event loop sees no later event until its
    /// subscriptions are complete. Returns the joined conversation ids.
    pub async fn join_all(
        &self,
        user: &UserId,
        handle: &ConnectionHandle,
    ) -> Result<Vec<ConversationId>, RepositoryError> {
        let conversations = self.repo.conversations_for_participant(user).await?;
        for conversation in &conversations {
            let room = self.rooms.get_or_create(conversation).await;
            room.add_member(user.clone(), handle.clone()).await;
        }
        log::debug!(
            "Connection {} joined {} conversation groups for {user}",
            handle.conn_id(),
            conversations.len()
        );
        Ok(conversations)
    }

    /// Wire a freshly-created group: subscribe every currently-reachable
    /// participant synchronously and notify the invited members (everyone
    /// but the creator) so their clients can render the new conversation
    /// without a refetch. Returns the notified user ids.
    pub async fn group_created(
        &self,
        presence: &PresenceRegistry,
        info: &ConversationInfo,
        created_by: &UserId,
    ) -> Vec<UserId> {
        let room = self.rooms.get_or_create(&info.id).await;
        let mut notified = Vec::new();

        for participant in &info.participants {
            let handle = match presence.lookup(participant).await {
                Some(handle) => handle,
                None => continue,
            };
            room.add_member(participant.clone(), handle.clone()).await;

            if participant == created_by {
                continue;
            }
            let event = ServerEvent::AddedToGroup {
                conversation: info.clone(),
            };
            match handle.send_event(&event) {
                Ok(true) => notified.push(participant.clone()),
                Ok(false) => {}
                Err(e) => log::warn!("Failed to encode group notification: {e}"),
            }
        }

        notified
    }
}
