//! Message fan-out and read-receipt reconciliation.
//!
//! ```text
//! SendMessage ──► repository (persist + last-message pointer)
//!                      │ success
//!                      ▼
//!             ConversationGroup ── MessageReceived ──► every member
//! ```
//!
//! Persistence comes first: a failed repository call aborts the event and
//! nothing is broadcast. Broadcasts go to the whole group, sender included,
//! so the sender's own client (and any of its other views) renders from the
//! same persisted record everyone else sees.

use std::sync::Arc;

use crate::protocol::{
    ConversationId, MediaRef, Message, MessageId, MessageKind, MessageStatus, ProtocolError,
    ServerEvent, UserId,
};
use crate::repository::{ChatRepository, NewMessage, RepositoryError};
use crate::rooms::RoomRegistry;

/// Errors from message operations.
#[derive(Debug)]
pub enum MessageError {
    Storage(RepositoryError),
    Protocol(ProtocolError),
    /// Deletion requested by someone other than the sender.
    NotSender,
    UnknownMessage(MessageId),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::NotSender => write!(f, "Only the sender may delete a message"),
            Self::UnknownMessage(id) => write!(f, "Unknown message {id}"),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<RepositoryError> for MessageError {
    fn from(e: RepositoryError) -> Self {
        Self::Storage(e)
    }
}

impl From<ProtocolError> for MessageError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Persists messages and fans them out to conversation groups.
pub struct MessageService {
    repo: Arc<dyn ChatRepository>,
    rooms: Arc<RoomRegistry>,
}

impl MessageService {
    pub fn new(repo: Arc<dyn ChatRepository>, rooms: Arc<RoomRegistry>) -> Self {
        Self { repo, rooms }
    }

    /// Persist and broadcast one message.
    ///
    /// The sender identity is the identified connection's, never taken from
    /// the payload. The message kind is sniffed from the media content type
    /// (`Text` when there is no media).
    pub async fn send(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
        content: Option<String>,
        media: Option<MediaRef>,
    ) -> Result<Message, MessageError> {
        let kind = media
            .as_ref()
            .map(|m| MessageKind::from_content_type(&m.content_type))
            .unwrap_or(MessageKind::Text);

        let message = self
            .repo
            .create_message(NewMessage {
                sender: sender.clone(),
                conversation: conversation.clone(),
                content,
                media: media.map(|m| m.reference),
                kind,
            })
            .await?;
        self.repo.set_last_message(conversation, &message.id).await?;

        if let Some(room) = self.rooms.get(conversation).await {
            let delivered = room
                .broadcast_event(&ServerEvent::MessageReceived { message: message.clone() }, None)
                .await?;
            log::debug!(
                "Message {} fanned out to {delivered} connections in {conversation}",
                message.id
            );
        }
        Ok(message)
    }

    /// Reconcile read receipts and broadcast which ids changed.
    ///
    /// An empty `ids` list is the bulk fallback: every message in the
    /// conversation not sent by the reader and not already read. The
    /// broadcast carries the explicit list when one was given (so replayed
    /// acknowledgments produce identical broadcasts), otherwise the set the
    /// repository reports as updated.
    pub async fn mark_read(
        &self,
        reader: &UserId,
        conversation: &ConversationId,
        ids: Vec<MessageId>,
    ) -> Result<Vec<MessageId>, MessageError> {
        let explicit = !ids.is_empty();
        let updated = self
            .repo
            .update_message_status(
                conversation,
                reader,
                if explicit { Some(&ids) } else { None },
                MessageStatus::Read,
            )
            .await?;

        let message_ids = if explicit { ids } else { updated };
        if let Some(room) = self.rooms.get(conversation).await {
            room.broadcast_event(
                &ServerEvent::MessagesRead {
                    conversation: conversation.clone(),
                    message_ids: message_ids.clone(),
                    by: reader.clone(),
                },
                None,
            )
            .await?;
        }
        Ok(message_ids)
    }

    /// Soft-delete one of the requester's own messages and broadcast the
    /// tombstone to the conversation.
    pub async fn delete(
        &self,
        requester: &UserId,
        message_id: &MessageId,
    ) -> Result<Message, MessageError> {
        let existing = self
            .repo
            .find_message(message_id)
            .await?
            .ok_or_else(|| MessageError::UnknownMessage(message_id.clone()))?;
        if &existing.sender.id != requester {
            return Err(MessageError::NotSender);
        }

        let tombstone = self.repo.delete_message(message_id).await?;
        if let Some(room) = self.rooms.get(&tombstone.conversation).await {
            room.broadcast_event(&ServerEvent::MessageUpdated { message: tombstone.clone() }, None)
                .await?;
        }
        Ok(tombstone)
    }
}
