//! Ephemeral typing indicators.
//!
//! Pure in-memory state, never persisted. An entry appears on
//! typing-start and disappears on typing-stop; there is no server-side
//! timeout — a client that crashes mid-typing leaves peers to age the
//! indicator out themselves. Entries for a user are swept when the user's
//! connection goes away so the table cannot leak.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::protocol::{ConversationId, UserId};

pub struct TypingTracker {
    typing: RwLock<HashMap<ConversationId, HashSet<UserId>>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self {
            typing: RwLock::new(HashMap::new()),
        }
    }

    /// Mark a user as typing. Returns false if they already were.
    pub async fn set_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        let mut typing = self.typing.write().await;
        typing
            .entry(conversation.clone())
            .or_default()
            .insert(user.clone())
    }

    /// Clear a user's typing flag. Returns false if they were not typing.
    pub async fn clear_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        let mut typing = self.typing.write().await;
        let Some(users) = typing.get_mut(conversation) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            typing.remove(conversation);
        }
        removed
    }

    pub async fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.typing
            .read()
            .await
            .get(conversation)
            .is_some_and(|users| users.contains(user))
    }

    pub async fn typists(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.typing
            .read()
            .await
            .get(conversation)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove the user from every conversation. Disconnect housekeeping.
    pub async fn clear_user(&self, user: &UserId) {
        let mut typing = self.typing.write().await;
        typing.retain(|_, users| {
            users.remove(user);
            !users.is_empty()
        });
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}
