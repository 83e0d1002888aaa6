//! WebSocket relay server: the live coordination layer.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── PresenceRegistry (user → conn)
//!             ├── ChatServer ── State ├── RoomRegistry (conversation groups)
//! Client B ──┘         │              ├── TypingTracker
//!                      │              └── CallRegistry (call sessions)
//!                      │
//!                ChatRepository / IdentityVerifier (external collaborators)
//! ```
//!
//! One task per connection. Every inbound event is handled to completion
//! before the next event from the same connection, so a connection that is
//! still joining its rooms sees no later event of its own — other
//! connections are never blocked by it. All cross-connection state lives in
//! the injected, lock-guarded tables above; there are no globals.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::calls::CallRegistry;
use crate::messages::MessageService;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::protocol::{
    ClientEvent, ConversationId, ConversationInfo, EndReason, RejectReason, ServerEvent, UserId,
};
use crate::repository::{ChatRepository, IdentityVerifier};
use crate::rooms::{MembershipManager, RoomRegistry};
use crate::typing::TypingTracker;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection outbox before drops
    pub outbox_capacity: usize,
    /// How long a call may ring before both sides are told it ended
    pub ring_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            ring_timeout: Duration::from_secs(30),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
}

/// Per-connection state owned by the connection task.
struct ConnSession {
    user: Option<UserId>,
    subscriptions: Vec<ConversationId>,
}

impl ConnSession {
    fn new() -> Self {
        Self {
            user: None,
            subscriptions: Vec::new(),
        }
    }
}

/// Everything the event handlers share, injected into each connection task.
struct ServerState {
    config: ServerConfig,
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomRegistry>,
    typing: TypingTracker,
    calls: Arc<CallRegistry>,
    membership: MembershipManager,
    messages: MessageService,
    verifier: Arc<dyn IdentityVerifier>,
    stats: RwLock<ServerStats>,
}

/// The relay server.
pub struct ChatServer {
    state: Arc<ServerState>,
}

impl ChatServer {
    pub fn new(
        config: ServerConfig,
        repo: Arc<dyn ChatRepository>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        let state = ServerState {
            config,
            presence: Arc::new(PresenceRegistry::new()),
            rooms: rooms.clone(),
            typing: TypingTracker::new(),
            calls: Arc::new(CallRegistry::new()),
            membership: MembershipManager::new(repo.clone(), rooms.clone()),
            messages: MessageService::new(repo, rooms),
            verifier,
            stats: RwLock::new(ServerStats::default()),
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Handle for the HTTP/CRUD layer to reach into the live layer.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: self.state.clone(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    /// Accept WebSocket connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Chat relay listening on {}", self.state.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Drive one WebSocket connection until it closes, then clean up.
async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut stats = state.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let (out_tx, mut out_rx) = mpsc::channel(state.config.outbox_capacity);
    let handle = ConnectionHandle::new(out_tx);
    let mut session = ConnSession::new();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match ClientEvent::decode(&bytes) {
                            Ok(event) => {
                                state.stats.write().await.total_events += 1;
                                state.dispatch(&handle, &mut session, event).await;
                            }
                            Err(e) => {
                                // Malformed events are rejected before they
                                // can touch shared state.
                                log::warn!("Undecodable frame from {addr}: {e}");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if ws_sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_sender
                            .send(WsMessage::Binary(frame.to_vec().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.disconnect(&handle, &session).await;
    {
        let mut stats = state.stats.write().await;
        stats.active_connections -= 1;
    }
    Ok(())
}

impl ServerState {
    /// Handle one client event. Failures affect only this connection.
    async fn dispatch(&self, handle: &ConnectionHandle, session: &mut ConnSession, event: ClientEvent) {
        // Identity comes first; everything else requires it.
        if let ClientEvent::Identify { credential } = &event {
            let credential = credential.clone();
            self.identify(handle, session, credential).await;
            return;
        }
        let Some(user) = session.user.clone() else {
            self.fail(handle, "identify required before any other event");
            return;
        };

        match event {
            ClientEvent::Identify { .. } => unreachable!("handled above"),

            ClientEvent::SendMessage { conversation, content, media } => {
                if let Err(e) = self.messages.send(&user, &conversation, content, media).await {
                    log::error!("Send from {user} to {conversation} failed: {e}");
                    self.fail(handle, "send-message failed");
                }
            }

            ClientEvent::MarkRead { conversation, message_ids } => {
                if let Err(e) = self.messages.mark_read(&user, &conversation, message_ids).await {
                    log::error!("Mark-read by {user} in {conversation} failed: {e}");
                    self.fail(handle, "mark-read failed");
                }
            }

            ClientEvent::DeleteMessage { message_id } => {
                if let Err(e) = self.messages.delete(&user, &message_id).await {
                    log::warn!("Delete of {message_id} by {user} failed: {e}");
                    self.fail(handle, "delete-message failed");
                }
            }

            ClientEvent::TypingStart { conversation } => {
                self.typing.set_typing(&conversation, &user).await;
                self.broadcast_typing(handle, &conversation, &user, true).await;
            }

            ClientEvent::TypingStop { conversation } => {
                self.typing.clear_typing(&conversation, &user).await;
                self.broadcast_typing(handle, &conversation, &user, false).await;
            }

            ClientEvent::CallInitiate { callee, offer, audio_only } => {
                self.call_initiate(handle, &user, callee, offer, audio_only).await;
            }

            ClientEvent::CallAccept { caller, answer } => {
                if self.calls.accept(&user, &caller).await.is_some() {
                    log::info!("Call accepted by {user}, answering {caller}");
                    self.forward(&caller, &ServerEvent::CallAccepted {
                        from: user,
                        answer,
                    })
                    .await;
                } else {
                    log::debug!("Stale call accept from {user} for {caller}");
                }
            }

            ClientEvent::CallReject { peer, reason } => {
                self.end_session_with(&user, &peer).await;
                self.forward(&peer, &ServerEvent::CallRejected { from: user, reason }).await;
            }

            ClientEvent::IceCandidate { peer, candidate } => {
                // Relayed unconditionally; a candidate arriving outside an
                // active negotiation is inert on the receiving end.
                self.forward(&peer, &ServerEvent::IceCandidate {
                    from: user,
                    candidate,
                })
                .await;
            }

            ClientEvent::HangUp { peer } => {
                self.end_session_with(&user, &peer).await;
                self.forward(&peer, &ServerEvent::CallEnded {
                    peer: user,
                    reason: EndReason::HangUp,
                })
                .await;
            }
        }
    }

    /// Resolve the credential, claim the presence slot, join rooms, ack.
    async fn identify(&self, handle: &ConnectionHandle, session: &mut ConnSession, credential: String) {
        if session.user.is_some() {
            self.fail(handle, "already identified");
            return;
        }

        let user = match self.verifier.resolve_identity(&credential).await {
            Ok(user) => user,
            Err(e) => {
                log::warn!("Identify rejected: {e}");
                self.fail(handle, "invalid credential");
                return;
            }
        };

        // One reachable endpoint per user: a superseded connection is told
        // so, instead of being silently orphaned.
        let evicted = self.presence.register(&user, handle.clone()).await;
        let was_online = evicted.is_some();
        if let Some(evicted) = evicted {
            log::info!("User {user} reconnected, evicting connection {}", evicted.conn_id());
            if let Err(e) = evicted.send_event(&ServerEvent::SessionReplaced) {
                log::warn!("Failed to notify superseded connection: {e}");
            }
        }

        // Room subscription is a storage round-trip. It completes before
        // this connection's loop sees any later event, closing the window
        // where a fan-out could miss the connection.
        let subscriptions = match self.membership.join_all(&user, handle).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                log::error!("Room subscription for {user} failed: {e}");
                self.presence.unregister(handle.conn_id()).await;
                self.fail(handle, "subscription failed");
                return;
            }
        };

        session.user = Some(user.clone());
        session.subscriptions = subscriptions;

        let online = self.presence.online_users().await;
        if let Err(e) = handle.send_event(&ServerEvent::IdentityAck {
            user_id: user.clone(),
            online,
        }) {
            log::warn!("Failed to ack identify for {user}: {e}");
        }

        // A reconnect is not a presence change; only announce a user whose
        // reachability actually flipped.
        if !was_online {
            self.announce_presence(handle, session, &user, true).await;
        }
        log::info!("User {user} online via connection {}", handle.conn_id());
    }

    /// Announce reachability to users sharing at least one conversation
    /// group — not to the world.
    async fn announce_presence(
        &self,
        handle: &ConnectionHandle,
        session: &ConnSession,
        user: &UserId,
        online: bool,
    ) {
        let event = ServerEvent::PresenceChanged {
            user_id: user.clone(),
            online,
        };
        let frame = match event.encode() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                log::warn!("Failed to encode presence announcement: {e}");
                return;
            }
        };
        for member in self
            .rooms
            .members_sharing(&session.subscriptions, handle.conn_id())
            .await
        {
            if &member.user_id != user {
                member.handle.send_frame(frame.clone());
            }
        }
    }

    async fn broadcast_typing(
        &self,
        handle: &ConnectionHandle,
        conversation: &ConversationId,
        user: &UserId,
        active: bool,
    ) {
        let Some(room) = self.rooms.get(conversation).await else {
            return;
        };
        let event = ServerEvent::Typing {
            conversation: conversation.clone(),
            user_id: user.clone(),
            active,
        };
        if let Err(e) = room.broadcast_event(&event, Some(handle.conn_id())).await {
            log::warn!("Typing broadcast failed: {e}");
        }
    }

    async fn call_initiate(
        &self,
        handle: &ConnectionHandle,
        caller: &UserId,
        callee: UserId,
        offer: String,
        audio_only: bool,
    ) {
        // Unreachable callee: drop silently. No session is created and the
        // caller hears nothing further about this attempt.
        let Some(callee_conn) = self.presence.lookup(&callee).await else {
            log::debug!("Call from {caller} to unreachable {callee} dropped");
            return;
        };

        let call = match self.calls.begin(caller, &callee, audio_only).await {
            Ok(call) => call,
            Err(e) => {
                // Glare: somebody is already in a session. The caller gets
                // an immediate busy rejection; the existing session is
                // untouched.
                log::info!("Call from {caller} to {callee} rejected: {e}");
                if let Err(e) = handle.send_event(&ServerEvent::CallRejected {
                    from: callee,
                    reason: RejectReason::Busy,
                }) {
                    log::warn!("Failed to send busy rejection: {e}");
                }
                return;
            }
        };

        log::info!("Call {} initiated: {caller} -> {callee}", call.call_id);
        if let Err(e) = callee_conn.send_event(&ServerEvent::IncomingCall {
            from: caller.clone(),
            offer,
            audio_only,
        }) {
            log::warn!("Failed to forward offer for call {}: {e}", call.call_id);
        }

        self.arm_ring_timer(call.call_id, caller.clone(), callee.clone());
    }

    /// Bound the ringing window: if nobody answered in time, the session
    /// is removed and both sides are told.
    fn arm_ring_timer(&self, call_id: Uuid, caller: UserId, callee: UserId) {
        let calls = self.calls.clone();
        let presence = self.presence.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if calls.expire_if_ringing(call_id).await.is_none() {
                return;
            }
            log::info!("Call {call_id} rang out after {timeout:?}");
            for (user, peer) in [(&caller, &callee), (&callee, &caller)] {
                if let Some(conn) = presence.lookup(user).await {
                    let _ = conn.send_event(&ServerEvent::CallEnded {
                        peer: peer.clone(),
                        reason: EndReason::RingTimeout,
                    });
                }
            }
        });
    }

    /// Remove the caller's session, but only if it really is with `peer`.
    async fn end_session_with(&self, user: &UserId, peer: &UserId) {
        if let Some(call) = self.calls.session_for(user).await {
            if call.peer_of(user) == Some(peer) {
                self.calls.end_for(user).await;
                log::info!("Call {} ended by {user}", call.call_id);
            }
        }
    }

    /// Point-to-point relay through the presence registry. An unreachable
    /// peer means a silent drop.
    async fn forward(&self, to: &UserId, event: &ServerEvent) {
        let Some(conn) = self.presence.lookup(to).await else {
            log::debug!("Dropping event for unreachable {to}");
            return;
        };
        if let Err(e) = conn.send_event(event) {
            log::warn!("Failed to forward event to {to}: {e}");
        }
    }

    /// Send a failure notice to the originating connection only.
    fn fail(&self, handle: &ConnectionHandle, context: &str) {
        if let Err(e) = handle.send_event(&ServerEvent::OperationFailed {
            context: context.to_string(),
        }) {
            log::warn!("Failed to report operation failure: {e}");
        }
    }

    /// Transport-level connection loss.
    async fn disconnect(&self, handle: &ConnectionHandle, session: &ConnSession) {
        let Some(user) = &session.user else {
            return;
        };

        // Only the connection that still owns the presence entry tears the
        // user's live state down; a superseded connection just leaves its
        // room memberships behind.
        let freed = self.presence.unregister(handle.conn_id()).await;
        if freed.as_ref() == Some(user) {
            // Reliable call teardown: the surviving peer learns the call is
            // over instead of waiting on a dead negotiation.
            if let Some(call) = self.calls.end_for(user).await {
                if let Some(peer) = call.peer_of(user) {
                    self.forward(peer, &ServerEvent::CallEnded {
                        peer: user.clone(),
                        reason: EndReason::PeerDisconnected,
                    })
                    .await;
                }
            }

            self.announce_presence(handle, session, user, false).await;
            self.typing.clear_user(user).await;
            log::info!("User {user} offline (connection {})", handle.conn_id());
        }

        for conversation in &session.subscriptions {
            self.rooms.leave(conversation, handle.conn_id()).await;
        }
    }
}

/// Hook for the HTTP/CRUD layer: query reachability and push events into
/// the live layer (group creation, icon updates, membership changes).
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<ServerState>,
}

impl RelayHandle {
    /// Snapshot of currently-reachable user ids.
    pub async fn reachable_users(&self) -> Vec<UserId> {
        self.state.presence.online_users().await
    }

    /// Push an event to one user's live connection. Returns false if the
    /// user is unreachable or the frame was dropped.
    pub async fn push_to_user(&self, user: &UserId, event: &ServerEvent) -> bool {
        match self.state.presence.lookup(user).await {
            Some(conn) => conn.send_event(event).unwrap_or(false),
            None => false,
        }
    }

    /// Push an event to every connection in a conversation group.
    pub async fn push_to_conversation(&self, conversation: &ConversationId, event: &ServerEvent) -> usize {
        match self.state.rooms.get(conversation).await {
            Some(room) => room.broadcast_event(event, None).await.unwrap_or(0),
            None => 0,
        }
    }

    /// Wire a group created through the CRUD surface: subscribe reachable
    /// participants now and notify the invited members.
    pub async fn group_created(&self, info: &ConversationInfo, created_by: &UserId) -> Vec<UserId> {
        self.state
            .membership
            .group_created(&self.state.presence, info, created_by)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, StaticVerifier};

    fn server_with(repo: Arc<MemoryRepository>) -> ChatServer {
        ChatServer::new(
            ServerConfig::default(),
            repo,
            Arc::new(StaticVerifier::trusting()),
        )
    }

    fn conn() -> (ConnectionHandle, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(32);
        (ConnectionHandle::new(tx), rx)
    }

    async fn recv_event(rx: &mut mpsc::Receiver<Arc<Vec<u8>>>) -> ServerEvent {
        let frame = rx.recv().await.expect("expected a frame");
        ServerEvent::decode(&frame).expect("frame should decode")
    }

    async fn identify(
        server: &ChatServer,
        handle: &ConnectionHandle,
        session: &mut ConnSession,
        user: &str,
    ) {
        server
            .state
            .dispatch(handle, session, ClientEvent::Identify {
                credential: user.to_string(),
            })
            .await;
    }

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbox_capacity, 256);
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = server_with(Arc::new(MemoryRepository::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_events, 0);
    }

    #[tokio::test]
    async fn test_events_before_identify_are_rejected() {
        let server = server_with(Arc::new(MemoryRepository::new()));
        let (handle, mut rx) = conn();
        let mut session = ConnSession::new();

        server
            .state
            .dispatch(&handle, &mut session, ClientEvent::TypingStart {
                conversation: "c1".into(),
            })
            .await;

        match recv_event(&mut rx).await {
            ServerEvent::OperationFailed { context } => {
                assert!(context.contains("identify"));
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        // Shared state untouched.
        assert!(!server.state.typing.is_typing(&"c1".to_string(), &"u1".to_string()).await);
    }

    #[tokio::test]
    async fn test_identify_acks_and_registers() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_conversation("c1", &["u1", "u2"]);
        let server = server_with(repo);

        let (handle, mut rx) = conn();
        let mut session = ConnSession::new();
        identify(&server, &handle, &mut session, "u1").await;

        match recv_event(&mut rx).await {
            ServerEvent::IdentityAck { user_id, online } => {
                assert_eq!(user_id, "u1");
                assert_eq!(online, vec!["u1".to_string()]);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(session.user.as_deref(), Some("u1"));
        assert_eq!(session.subscriptions, vec!["c1".to_string()]);
        assert!(server.state.presence.is_online(&"u1".to_string()).await);
    }

    #[tokio::test]
    async fn test_invalid_credential_rejected() {
        let server = ChatServer::new(
            ServerConfig::default(),
            Arc::new(MemoryRepository::new()),
            Arc::new(StaticVerifier::new()),
        );
        let (handle, mut rx) = conn();
        let mut session = ConnSession::new();

        identify(&server, &handle, &mut session, "unknown-token").await;
        match recv_event(&mut rx).await {
            ServerEvent::OperationFailed { context } => {
                assert!(context.contains("credential"));
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert!(session.user.is_none());
        assert_eq!(server.state.presence.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_evicts_with_notice() {
        let server = server_with(Arc::new(MemoryRepository::new()));

        let (old, mut old_rx) = conn();
        let mut old_session = ConnSession::new();
        identify(&server, &old, &mut old_session, "u1").await;
        let _ = recv_event(&mut old_rx).await; // ack

        let (new, _new_rx) = conn();
        let mut new_session = ConnSession::new();
        identify(&server, &new, &mut new_session, "u1").await;

        assert_eq!(recv_event(&mut old_rx).await, ServerEvent::SessionReplaced);
        let current = server.state.presence.lookup(&"u1".to_string()).await.unwrap();
        assert_eq!(current.conn_id(), new.conn_id());
    }

    #[tokio::test]
    async fn test_superseded_disconnect_keeps_user_online() {
        let server = server_with(Arc::new(MemoryRepository::new()));

        let (old, _old_rx) = conn();
        let mut old_session = ConnSession::new();
        identify(&server, &old, &mut old_session, "u1").await;

        let (new, _new_rx) = conn();
        let mut new_session = ConnSession::new();
        identify(&server, &new, &mut new_session, "u1").await;

        // The evicted connection's socket finally closes.
        server.state.disconnect(&old, &old_session).await;
        assert!(server.state.presence.is_online(&"u1".to_string()).await);
    }

    #[tokio::test]
    async fn test_presence_announcement_scoped_to_shared_rooms() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_conversation("c1", &["u1", "u2"]);
        repo.add_conversation("c9", &["u3", "u4"]);
        let server = server_with(repo);

        let (peer, mut peer_rx) = conn();
        let mut peer_session = ConnSession::new();
        identify(&server, &peer, &mut peer_session, "u2").await;
        let _ = recv_event(&mut peer_rx).await; // ack

        let (stranger, mut stranger_rx) = conn();
        let mut stranger_session = ConnSession::new();
        identify(&server, &stranger, &mut stranger_session, "u3").await;
        let _ = recv_event(&mut stranger_rx).await; // ack

        let (subject, _subject_rx) = conn();
        let mut subject_session = ConnSession::new();
        identify(&server, &subject, &mut subject_session, "u1").await;

        // u2 shares c1 with u1 and hears about it; u3 shares nothing.
        assert_eq!(
            recv_event(&mut peer_rx).await,
            ServerEvent::PresenceChanged { user_id: "u1".into(), online: true }
        );
        assert!(stranger_rx.try_recv().is_err());

        // Offline announcement is scoped the same way.
        server.state.disconnect(&subject, &subject_session).await;
        assert_eq!(
            recv_event(&mut peer_rx).await,
            ServerEvent::PresenceChanged { user_id: "u1".into(), online: false }
        );
        assert!(stranger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_to_originator_only() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_conversation("c1", &["u1", "u2"]);
        let server = server_with(repo.clone());

        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        let (b, mut b_rx) = conn();
        let mut b_session = ConnSession::new();
        identify(&server, &b, &mut b_session, "u2").await;
        let _ = recv_event(&mut b_rx).await;
        let _ = recv_event(&mut a_rx).await; // u2's presence announcement

        repo.fail_next();
        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::SendMessage {
                conversation: "c1".into(),
                content: Some("hi".into()),
                media: None,
            })
            .await;

        match recv_event(&mut a_rx).await {
            ServerEvent::OperationFailed { context } => {
                assert!(context.contains("send-message"));
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_to_unreachable_user_is_dropped() {
        let server = server_with(Arc::new(MemoryRepository::new()));
        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::CallInitiate {
                callee: "u2".into(),
                offer: "sdp-offer".into(),
                audio_only: false,
            })
            .await;

        // No session, no events anywhere.
        assert_eq!(server.state.calls.session_count().await, 0);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_relay_roundtrip() {
        let server = server_with(Arc::new(MemoryRepository::new()));

        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        let (b, mut b_rx) = conn();
        let mut b_session = ConnSession::new();
        identify(&server, &b, &mut b_session, "u2").await;
        let _ = recv_event(&mut b_rx).await;

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::CallInitiate {
                callee: "u2".into(),
                offer: "the-offer".into(),
                audio_only: true,
            })
            .await;
        assert_eq!(
            recv_event(&mut b_rx).await,
            ServerEvent::IncomingCall {
                from: "u1".into(),
                offer: "the-offer".into(),
                audio_only: true,
            }
        );

        server
            .state
            .dispatch(&b, &mut b_session, ClientEvent::CallAccept {
                caller: "u1".into(),
                answer: "the-answer".into(),
            })
            .await;
        assert_eq!(
            recv_event(&mut a_rx).await,
            ServerEvent::CallAccepted { from: "u2".into(), answer: "the-answer".into() }
        );

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::IceCandidate {
                peer: "u2".into(),
                candidate: "candidate:1".into(),
            })
            .await;
        assert_eq!(
            recv_event(&mut b_rx).await,
            ServerEvent::IceCandidate { from: "u1".into(), candidate: "candidate:1".into() }
        );

        server
            .state
            .dispatch(&b, &mut b_session, ClientEvent::HangUp { peer: "u1".into() })
            .await;
        assert_eq!(
            recv_event(&mut a_rx).await,
            ServerEvent::CallEnded { peer: "u2".into(), reason: EndReason::HangUp }
        );
        assert_eq!(server.state.calls.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_caller_gets_busy() {
        let server = server_with(Arc::new(MemoryRepository::new()));

        let mut conns = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let (c, mut rx) = conn();
            let mut session = ConnSession::new();
            identify(&server, &c, &mut session, user).await;
            let _ = recv_event(&mut rx).await;
            conns.push((c, rx, session));
        }
        let (a, _a_rx, mut a_session) = conns.remove(0);
        let (_b, mut b_rx, _b_session) = conns.remove(0);
        let (c, mut c_rx, mut c_session) = conns.remove(0);

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::CallInitiate {
                callee: "u2".into(),
                offer: "offer-a".into(),
                audio_only: false,
            })
            .await;
        let _ = recv_event(&mut b_rx).await;

        server
            .state
            .dispatch(&c, &mut c_session, ClientEvent::CallInitiate {
                callee: "u2".into(),
                offer: "offer-c".into(),
                audio_only: false,
            })
            .await;

        assert_eq!(
            recv_event(&mut c_rx).await,
            ServerEvent::CallRejected { from: "u2".into(), reason: RejectReason::Busy }
        );
        // The first session is unaffected and u2 heard nothing new.
        assert_eq!(server.state.calls.session_count().await, 1);
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_mid_call_notifies_peer() {
        let server = server_with(Arc::new(MemoryRepository::new()));

        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        let (b, mut b_rx) = conn();
        let mut b_session = ConnSession::new();
        identify(&server, &b, &mut b_session, "u2").await;
        let _ = recv_event(&mut b_rx).await;

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::CallInitiate {
                callee: "u2".into(),
                offer: "offer".into(),
                audio_only: false,
            })
            .await;
        let _ = recv_event(&mut b_rx).await;
        server
            .state
            .dispatch(&b, &mut b_session, ClientEvent::CallAccept {
                caller: "u1".into(),
                answer: "answer".into(),
            })
            .await;
        let _ = recv_event(&mut a_rx).await;

        server.state.disconnect(&b, &b_session).await;
        assert_eq!(
            recv_event(&mut a_rx).await,
            ServerEvent::CallEnded { peer: "u2".into(), reason: EndReason::PeerDisconnected }
        );
        assert_eq!(server.state.calls.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_ring_timeout_notifies_both_sides() {
        let config = ServerConfig {
            ring_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let server = ChatServer::new(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(StaticVerifier::trusting()),
        );

        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        let (b, mut b_rx) = conn();
        let mut b_session = ConnSession::new();
        identify(&server, &b, &mut b_session, "u2").await;
        let _ = recv_event(&mut b_rx).await;

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::CallInitiate {
                callee: "u2".into(),
                offer: "offer".into(),
                audio_only: false,
            })
            .await;
        let _ = recv_event(&mut b_rx).await; // incoming call, never answered

        assert_eq!(
            recv_event(&mut a_rx).await,
            ServerEvent::CallEnded { peer: "u2".into(), reason: EndReason::RingTimeout }
        );
        assert_eq!(
            recv_event(&mut b_rx).await,
            ServerEvent::CallEnded { peer: "u1".into(), reason: EndReason::RingTimeout }
        );
        assert_eq!(server.state.calls.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_typing_skips_originator() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_conversation("c1", &["u1", "u2"]);
        let server = server_with(repo);

        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        let (b, mut b_rx) = conn();
        let mut b_session = ConnSession::new();
        identify(&server, &b, &mut b_session, "u2").await;
        let _ = recv_event(&mut b_rx).await;
        let _ = recv_event(&mut a_rx).await; // u2 came online

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::TypingStart { conversation: "c1".into() })
            .await;
        assert_eq!(
            recv_event(&mut b_rx).await,
            ServerEvent::Typing { conversation: "c1".into(), user_id: "u1".into(), active: true }
        );
        assert!(a_rx.try_recv().is_err());

        server
            .state
            .dispatch(&a, &mut a_session, ClientEvent::TypingStop { conversation: "c1".into() })
            .await;
        assert_eq!(
            recv_event(&mut b_rx).await,
            ServerEvent::Typing { conversation: "c1".into(), user_id: "u1".into(), active: false }
        );
        assert!(!server.state.typing.is_typing(&"c1".to_string(), &"u1".to_string()).await);
    }

    #[tokio::test]
    async fn test_relay_handle_group_creation_and_push() {
        let repo = Arc::new(MemoryRepository::new());
        let server = server_with(repo);
        let relay = server.handle();

        let (a, mut a_rx) = conn();
        let mut a_session = ConnSession::new();
        identify(&server, &a, &mut a_session, "u1").await;
        let _ = recv_event(&mut a_rx).await;

        let (b, mut b_rx) = conn();
        let mut b_session = ConnSession::new();
        identify(&server, &b, &mut b_session, "u2").await;
        let _ = recv_event(&mut b_rx).await;

        let mut reachable = relay.reachable_users().await;
        reachable.sort();
        assert_eq!(reachable, vec!["u1".to_string(), "u2".to_string()]);

        let info = ConversationInfo {
            id: "g1".into(),
            name: Some("team".into()),
            participants: vec!["u1".into(), "u2".into(), "u5".into()],
        };
        let notified = relay.group_created(&info, &"u1".to_string()).await;
        assert_eq!(notified, vec!["u2".to_string()]);
        match recv_event(&mut b_rx).await {
            ServerEvent::AddedToGroup { conversation } => assert_eq!(conversation.id, "g1"),
            other => panic!("Unexpected event: {other:?}"),
        }

        // Icon-update style push through the CRUD hook reaches both members.
        let pushed = relay
            .push_to_conversation(&"g1".to_string(), &ServerEvent::PresenceChanged {
                user_id: "u5".into(),
                online: false,
            })
            .await;
        assert_eq!(pushed, 2);

        assert!(relay.push_to_user(&"u1".to_string(), &ServerEvent::SessionReplaced).await);
        assert!(!relay.push_to_user(&"u9".to_string(), &ServerEvent::SessionReplaced).await);
    }
}
