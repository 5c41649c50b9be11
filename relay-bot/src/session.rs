//! Registry of open chat sessions.
//!
//! Each user is either Idle (no entry) or Active (one entry). Admission is an
//! atomic check-and-insert, so concurrent `chat` commands from one user can
//! never open two sessions.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// An open session.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub user_id: String,
    /// Channel the session was opened in
    pub channel_id: String,
    pub started_at: DateTime<Utc>,
}

/// Tracks which users currently have an open session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionToken>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `user_id` if it has no open session. Returns `false` when denied.
    pub fn try_admit(&self, user_id: &str, channel_id: &str) -> bool {
        match self.sessions.entry(user_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SessionToken {
                    user_id: user_id.to_string(),
                    channel_id: channel_id.to_string(),
                    started_at: Utc::now(),
                });
                true
            }
        }
    }

    /// Close the session for `user_id`. Safe to call when none is open.
    pub fn release(&self, user_id: &str) {
        if self.sessions.remove(user_id).is_some() {
            tracing::debug!(user_id = %user_id, "Session released");
        }
    }

    /// Admit `user_id` and return a guard that releases the session on drop.
    pub fn admit(self: &Arc<Self>, user_id: &str, channel_id: &str) -> Option<SessionGuard> {
        self.try_admit(user_id, channel_id).then(|| SessionGuard {
            registry: Arc::clone(self),
            user_id: user_id.to_string(),
        })
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn session(&self, user_id: &str) -> Option<SessionToken> {
        self.sessions.get(user_id).map(|s| s.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Releases its session when dropped, whatever ended it.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    user_id: String,
}

impl SessionGuard {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.user_id);
    }
}
