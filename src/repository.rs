//! Storage and identity collaborators.
//!
//! Durable storage of users, conversations and messages lives outside the
//! relay; the core consumes it through [`ChatRepository`]. Credential
//! verification is likewise external, behind [`IdentityVerifier`]. Both are
//! injected as trait objects so the real backends can be swapped for the
//! in-memory implementations in tests and the development binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::protocol::{
    ConversationId, Message, MessageId, MessageKind, MessageStatus, SenderProfile, UserId,
};

/// Fields for a message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: UserId,
    pub conversation: ConversationId,
    pub content: Option<String>,
    pub media: Option<String>,
    pub kind: MessageKind,
}

/// Repository errors.
#[derive(Debug, Clone)]
pub enum RepositoryError {
    /// The backing store refused or failed the operation.
    Unavailable(String),
    /// The referenced record does not exist.
    NotFound(String),
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
            Self::NotFound(what) => write!(f, "Not found: {what}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// The storage operations the live coordination layer consumes.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// All conversation ids where the user is a participant.
    async fn conversations_for_participant(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationId>, RepositoryError>;

    /// Persist a message and return the stored, sender-populated record.
    async fn create_message(&self, new: NewMessage) -> Result<Message, RepositoryError>;

    /// Update the conversation's last-message pointer.
    async fn set_last_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
    ) -> Result<(), RepositoryError>;

    /// Advance message status for an acknowledging user.
    ///
    /// With `ids`, only those messages are considered; without, every
    /// message in the conversation. Either way a message only changes if it
    /// was not sent by the acknowledger and the transition moves its status
    /// forward. Returns the ids actually updated.
    async fn update_message_status(
        &self,
        conversation: &ConversationId,
        acknowledger: &UserId,
        ids: Option<&[MessageId]>,
        status: MessageStatus,
    ) -> Result<Vec<MessageId>, RepositoryError>;

    async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError>;

    /// Soft-delete: replace content with a tombstone, clear the media
    /// reference, mark deleted. Returns the tombstoned record.
    async fn delete_message(&self, id: &MessageId) -> Result<Message, RepositoryError>;
}

/// Identity verification errors.
#[derive(Debug, Clone)]
pub enum IdentityError {
    InvalidCredential,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCredential => write!(f, "Invalid credential"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Turns an opaque connection credential into a user id.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn resolve_identity(&self, credential: &str) -> Result<UserId, IdentityError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory implementations
// ───────────────────────────────────────────────────────────────────

struct MemoryInner {
    users: HashMap<UserId, SenderProfile>,
    /// conversation id → participant user ids
    conversations: HashMap<ConversationId, Vec<UserId>>,
    /// conversation id → last message id
    last_messages: HashMap<ConversationId, MessageId>,
    messages: HashMap<MessageId, Message>,
    /// insertion order per conversation, for deterministic bulk updates
    order: HashMap<ConversationId, Vec<MessageId>>,
    next_message_id: u64,
}

/// In-memory [`ChatRepository`] for tests and the development server.
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
    fail_next: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                users: HashMap::new(),
                conversations: HashMap::new(),
                last_messages: HashMap::new(),
                messages: HashMap::new(),
                order: HashMap::new(),
                next_message_id: 0,
            }),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn add_user(&self, id: &str, username: &str) {
        let mut inner = self.inner.lock().expect("repository lock poisoned");
        inner.users.insert(
            id.to_string(),
            SenderProfile {
                id: id.to_string(),
                username: username.to_string(),
                avatar: None,
            },
        );
    }

    pub fn add_conversation(&self, id: &str, participants: &[&str]) {
        let mut inner = self.inner.lock().expect("repository lock poisoned");
        inner.conversations.insert(
            id.to_string(),
            participants.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Make the next mutating call fail, to exercise persistence-failure
    /// paths.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn last_message_of(&self, conversation: &str) -> Option<MessageId> {
        let inner = self.inner.lock().expect("repository lock poisoned");
        inner.last_messages.get(conversation).cloned()
    }

    fn take_failure(&self) -> Result<(), RepositoryError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            Err(RepositoryError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatRepository for MemoryRepository {
    async fn conversations_for_participant(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationId>, RepositoryError> {
        let inner = self.inner.lock().expect("repository lock poisoned");
        let mut ids: Vec<ConversationId> = inner
            .conversations
            .iter()
            .filter(|(_, participants)| participants.contains(user))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, RepositoryError> {
        self.take_failure()?;
        let mut inner = self.inner.lock().expect("repository lock poisoned");
        inner.next_message_id += 1;
        let id = format!("m{}", inner.next_message_id);

        let sender = inner
            .users
            .get(&new.sender)
            .cloned()
            .unwrap_or_else(|| SenderProfile {
                id: new.sender.clone(),
                username: new.sender.clone(),
                avatar: None,
            });

        let message = Message {
            id: id.clone(),
            conversation: new.conversation.clone(),
            sender,
            content: new.content,
            media: new.media,
            kind: new.kind,
            status: MessageStatus::Sent,
            deleted: false,
            created_at_ms: Self::now_ms(),
        };
        inner.messages.insert(id.clone(), message.clone());
        inner.order.entry(new.conversation).or_default().push(id);
        Ok(message)
    }

    async fn set_last_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
    ) -> Result<(), RepositoryError> {
        self.take_failure()?;
        let mut inner = self.inner.lock().expect("repository lock poisoned");
        inner
            .last_messages
            .insert(conversation.clone(), message.clone());
        Ok(())
    }

    async fn update_message_status(
        &self,
        conversation: &ConversationId,
        acknowledger: &UserId,
        ids: Option<&[MessageId]>,
        status: MessageStatus,
    ) -> Result<Vec<MessageId>, RepositoryError> {
        self.take_failure()?;
        let mut inner = self.inner.lock().expect("repository lock poisoned");

        let candidates: Vec<MessageId> = match ids {
            Some(ids) => ids.to_vec(),
            None => inner
                .order
                .get(conversation)
                .cloned()
                .unwrap_or_default(),
        };

        let mut updated = Vec::new();
        for id in candidates {
            if let Some(message) = inner.messages.get_mut(&id) {
                if &message.conversation != conversation
                    || &message.sender.id == acknowledger
                    || !message.status.can_advance_to(status)
                {
                    continue;
                }
                message.status = status;
                updated.push(id);
            }
        }
        Ok(updated)
    }

    async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        let inner = self.inner.lock().expect("repository lock poisoned");
        Ok(inner.messages.get(id).cloned())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<Message, RepositoryError> {
        self.take_failure()?;
        let mut inner = self.inner.lock().expect("repository lock poisoned");
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("message {id}")))?;
        message.content = Some("This message was deleted".into());
        message.media = None;
        message.kind = MessageKind::Text;
        message.deleted = true;
        Ok(message.clone())
    }
}

/// Credential table for tests and development.
///
/// In trusting mode the credential itself is taken as the user id — never
/// use that outside a development setup.
pub struct StaticVerifier {
    tokens: Mutex<HashMap<String, UserId>>,
    trust_bare_ids: bool,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            trust_bare_ids: false,
        }
    }

    /// Accept any credential as its own user id.
    pub fn trusting() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            trust_bare_ids: true,
        }
    }

    pub fn add_token(&self, credential: &str, user: &str) {
        let mut tokens = self.tokens.lock().expect("verifier lock poisoned");
        tokens.insert(credential.to_string(), user.to_string());
    }
}

impl Default for StaticVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn resolve_identity(&self, credential: &str) -> Result<UserId, IdentityError> {
        {
            let tokens = self.tokens.lock().expect("verifier lock poisoned");
            if let Some(user) = tokens.get(credential) {
                return Ok(user.clone());
            }
        }
        if self.trust_bare_ids && !credential.is_empty() {
            return Ok(credential.to_string());
        }
        Err(IdentityError::InvalidCredential)
    }
}
