//! # chat-relay — real-time coordination layer for a chat application
//!
//! The hard part of a chat backend is not the CRUD — it is knowing who is
//! reachable right now, fanning events out to exactly the right live
//! connections, reconciling read state under concurrent acknowledgments,
//! and relaying call negotiation without deadlocking on glare. That layer
//! is this crate. Accounts, friend graphs and durable conversation storage
//! stay behind the [`repository`] traits.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐      WebSocket      ┌────────────┐
//! │ ChatClient │ ◄─────────────────► │ ChatServer │
//! │ (per user) │    Binary frames    │  (central) │
//! └────────────┘                     └─────┬──────┘
//!                                          │
//!                     ┌────────────────────┼────────────────────┐
//!                     ▼                    ▼                    ▼
//!              PresenceRegistry      RoomRegistry         CallRegistry
//!              (user → conn)      (conversation fan-out)  (call sessions)
//!                                          │
//!                                          ▼
//!                                   ChatRepository
//!                                 (external storage)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded events)
//! - [`presence`] — who is reachable, one live connection per user
//! - [`rooms`] — conversation groups and membership
//! - [`messages`] — message fan-out, read receipts, deletion
//! - [`typing`] — ephemeral typing indicators
//! - [`calls`] — call sessions and their state machine
//! - [`server`] — the WebSocket relay server
//! - [`client`] — a client for tests and tooling
//! - [`repository`] — storage and identity collaborator traits

pub mod calls;
pub mod client;
pub mod messages;
pub mod presence;
pub mod protocol;
pub mod repository;
pub mod rooms;
pub mod server;
pub mod typing;

// Re-exports for convenience
pub use calls::{BeginCallError, CallRegistry, CallSession, CallState};
pub use client::{ChatClient, ConnectionState};
pub use messages::{MessageError, MessageService};
pub use presence::{ConnectionHandle, PresenceRegistry};
pub use protocol::{
    ClientEvent, ConversationId, ConversationInfo, EndReason, MediaRef, Message, MessageId,
    MessageKind, MessageStatus, ProtocolError, RejectReason, SenderProfile, ServerEvent, UserId,
};
pub use repository::{
    ChatRepository, IdentityError, IdentityVerifier, MemoryRepository, NewMessage,
    RepositoryError, StaticVerifier,
};
pub use rooms::{ConversationGroup, GroupMember, MembershipManager, RoomRegistry};
pub use server::{ChatServer, RelayHandle, ServerConfig, ServerStats};
pub use typing::TypingTracker;
