//! Call-signaling sessions and their state machine.
//!
//! ```text
//!            initiate            accept
//!   (none) ──────────► Ringing ──────────► Active
//!                         │                   │
//!                         │ reject / timeout  │ hang-up / disconnect
//!                         ▼                   ▼
//!                      (removed)          (removed)
//! ```
//!
//! The registry tracks one session per participating user. `Ringing`
//! covers the whole pre-answer window (the caller is dialing, the callee's
//! client is ringing); an ended session is simply removed. The per-user
//! index is what makes busy detection and disconnect teardown possible:
//! a user with an entry is in a call, full stop.
//!
//! SDP payloads pass through the relay layer and are never stored here —
//! the session only remembers who is talking to whom.

use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Active,
}

/// One in-flight call between two users.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: Uuid,
    pub caller: UserId,
    pub callee: UserId,
    pub audio_only: bool,
    pub state: CallState,
}

impl CallSession {
    /// The other party, if `user` is part of this session.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.caller == user {
            Some(&self.callee)
        } else if &self.callee == user {
            Some(&self.caller)
        } else {
            None
        }
    }
}

/// Why a call could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginCallError {
    /// The initiating user is already in a session.
    CallerBusy,
    /// The target user is already in a session.
    CalleeBusy,
}

impl std::fmt::Display for BeginCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CallerBusy => write!(f, "Caller is already in a call"),
            Self::CalleeBusy => write!(f, "Callee is already in a call"),
        }
    }
}

impl std::error::Error for BeginCallError {}

#[derive(Default)]
struct CallTable {
    sessions: HashMap<Uuid, CallSession>,
    by_user: HashMap<UserId, Uuid>,
}

/// Process-wide table of in-flight calls, injected like the other shared
/// tables.
pub struct CallRegistry {
    inner: Mutex<CallTable>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CallTable::default()),
        }
    }

    /// Start a `Ringing` session, unless either party is already in one.
    /// The busy check and the insertion happen under one lock, so two
    /// near-simultaneous initiations cannot both claim the same callee.
    pub async fn begin(
        &self,
        caller: &UserId,
        callee: &UserId,
        audio_only: bool,
    ) -> Result<CallSession, BeginCallError> {
        let mut table = self.inner.lock().await;
        if table.by_user.contains_key(caller) {
            return Err(BeginCallError::CallerBusy);
        }
        if table.by_user.contains_key(callee) {
            return Err(BeginCallError::CalleeBusy);
        }

        let session = CallSession {
            call_id: Uuid::new_v4(),
            caller: caller.clone(),
            callee: callee.clone(),
            audio_only,
            state: CallState::Ringing,
        };
        table.by_user.insert(caller.clone(), session.call_id);
        table.by_user.insert(callee.clone(), session.call_id);
        table.sessions.insert(session.call_id, session.clone());
        Ok(session)
    }

    /// Callee answers: `Ringing` → `Active`. Returns the updated session,
    /// or `None` when no matching ringing session exists (it timed out,
    /// was hung up, or the parties don't line up) — a stale accept is
    /// simply ignored.
    pub async fn accept(&self, callee: &UserId, caller: &UserId) -> Option<CallSession> {
        let mut table = self.inner.lock().await;
        let call_id = *table.by_user.get(callee)?;
        let session = table.sessions.get_mut(&call_id)?;
        if session.state != CallState::Ringing
            || &session.callee != callee
            || &session.caller != caller
        {
            return None;
        }
        session.state = CallState::Active;
        Some(session.clone())
    }

    /// Remove the session `user` is part of (hang-up, rejection or
    /// disconnect all end the same way). Returns the removed session.
    pub async fn end_for(&self, user: &UserId) -> Option<CallSession> {
        let mut table = self.inner.lock().await;
        let call_id = table.by_user.get(user).copied()?;
        let session = table.sessions.remove(&call_id)?;
        table.by_user.remove(&session.caller);
        table.by_user.remove(&session.callee);
        Some(session)
    }

    /// Remove the session only if it is still ringing. The ring timer
    /// calls this; an answered call is left alone.
    pub async fn expire_if_ringing(&self, call_id: Uuid) -> Option<CallSession> {
        let mut table = self.inner.lock().await;
        match table.sessions.get(&call_id) {
            Some(session) if session.state == CallState::Ringing => {}
            _ => return None,
        }
        let session = table.sessions.remove(&call_id)?;
        table.by_user.remove(&session.caller);
        table.by_user.remove(&session.callee);
        Some(session)
    }

    /// The session a user is currently part of, if any.
    pub async fn session_for(&self, user: &UserId) -> Option<CallSession> {
        let table = self.inner.lock().await;
        let call_id = table.by_user.get(user)?;
        table.sessions.get(call_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
