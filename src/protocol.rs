//! Binary wire protocol between chat clients and the relay server.
//!
//! Every WebSocket frame carries one bincode-encoded event:
//!
//! ```text
//! client ──ClientEvent──►  server
//! client ◄──ServerEvent──  server
//! ```
//!
//! Ids for users, conversations and messages are opaque strings assigned
//! by the storage collaborator. SDP blobs and ICE candidates are relayed
//! verbatim and never inspected.

use serde::{Deserialize, Serialize};

/// A user identity, as issued by the identity verifier.
pub type UserId = String;
/// A conversation identifier, as stored by the repository.
pub type ConversationId = String;
/// A message identifier, as stored by the repository.
pub type MessageId = String;

/// Reference to an already-uploaded media object.
///
/// The upload collaborator stores the bytes; the relay only carries the
/// reference and uses the content type to derive the message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub reference: String,
    pub content_type: String,
}

/// Kind of a chat message, derived from the attached media (if any).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageKind {
    /// Sniff the kind from a media content type (`image/png` → `Image`).
    /// Anything unrecognized is a generic `File`.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            MessageKind::Image
        } else if content_type.starts_with("video/") {
            MessageKind::Video
        } else if content_type.starts_with("audio/") {
            MessageKind::Audio
        } else {
            MessageKind::File
        }
    }
}

/// Delivery status of a persisted message.
///
/// Status only ever moves forward (`Sent` → `Delivered` → `Read`) but
/// `Delivered` may be skipped: a direct `Sent` → `Read` transition is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }

    /// Whether a transition to `next` moves the status forward.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Sender identity attached to every broadcast message, so clients can
/// render it without a profile refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

/// A persisted chat message, as returned by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub sender: SenderProfile,
    pub content: Option<String>,
    pub media: Option<String>,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub deleted: bool,
    pub created_at_ms: u64,
}

/// Conversation summary pushed to members added to a new group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub name: Option<String>,
    pub participants: Vec<UserId>,
}

/// Why a call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The callee (or caller) is already in a session.
    Busy,
    /// The callee declined.
    Declined,
}

/// Why an established or ringing call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    HangUp,
    RingTimeout,
    PeerDisconnected,
}

/// Events sent by clients to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Must be the first event on a connection. The credential is resolved
    /// to a user id by the identity verifier; everything before a
    /// successful identify is rejected.
    Identify { credential: String },

    /// Send a message to a conversation. The sender identity comes from
    /// the identified connection, never from the payload.
    SendMessage {
        conversation: ConversationId,
        content: Option<String>,
        media: Option<MediaRef>,
    },

    /// Acknowledge messages as read. An empty id list is the bulk
    /// fallback: every eligible message in the conversation.
    MarkRead {
        conversation: ConversationId,
        message_ids: Vec<MessageId>,
    },

    /// Soft-delete one of the sender's own messages for everyone.
    DeleteMessage { message_id: MessageId },

    TypingStart { conversation: ConversationId },
    TypingStop { conversation: ConversationId },

    CallInitiate {
        callee: UserId,
        offer: String,
        audio_only: bool,
    },
    CallAccept { caller: UserId, answer: String },
    CallReject { peer: UserId, reason: RejectReason },
    IceCandidate { peer: UserId, candidate: String },
    HangUp { peer: UserId },
}

/// Events pushed by the relay to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Identify succeeded. Carries the snapshot of currently-online users.
    IdentityAck {
        user_id: UserId,
        online: Vec<UserId>,
    },

    /// A user sharing at least one conversation went on- or offline.
    PresenceChanged { user_id: UserId, online: bool },

    /// This connection was superseded by a newer one for the same user.
    SessionReplaced,

    MessageReceived { message: Message },

    /// An existing message changed (deletion tombstone).
    MessageUpdated { message: Message },

    MessagesRead {
        conversation: ConversationId,
        message_ids: Vec<MessageId>,
        by: UserId,
    },

    Typing {
        conversation: ConversationId,
        user_id: UserId,
        active: bool,
    },

    AddedToGroup { conversation: ConversationInfo },

    IncomingCall {
        from: UserId,
        offer: String,
        audio_only: bool,
    },
    CallAccepted { from: UserId, answer: String },
    CallRejected { from: UserId, reason: RejectReason },
    CallEnded { peer: UserId, reason: EndReason },
    IceCandidate { from: UserId, candidate: String },

    /// The triggering event failed server-side; sent to the originating
    /// connection only.
    OperationFailed { context: String },
}

impl ClientEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

impl ServerEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
