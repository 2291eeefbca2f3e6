//! Bookkeeping of open chat connections per user and session.
//!
//! The registry is only consulted for cleanup and diagnostics; messages are
//! never routed through it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::types::{ConnectionId, SessionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<UserId, HashMap<SessionId, ConnectionEntry>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, HashMap<SessionId, ConnectionEntry>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a new connection. A later connection with the same user and
    /// session replaces the earlier entry.
    pub fn register(&self, user_id: UserId, session_id: SessionId) -> ConnectionId {
        let entry = ConnectionEntry {
            connection_id: ConnectionId::new(),
            connected_at: Utc::now(),
        };
        let connection_id = entry.connection_id;
        let replaced = self
            .lock()
            .entry(user_id)
            .or_default()
            .insert(session_id.clone(), entry);
        if replaced.is_some() {
            tracing::debug!(%user_id, %session_id, "Session connection replaced");
        }
        connection_id
    }

    /// Removes the entry if it still belongs to `connection_id`.
    ///
    /// Returns whether anything was removed; unknown pairs are a no-op.
    pub fn unregister(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        connection_id: ConnectionId,
    ) -> bool {
        let mut map = self.lock();
        let Some(sessions) = map.get_mut(&user_id) else {
            return false;
        };
        let owned = sessions
            .get(session_id)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if owned {
            sessions.remove(session_id);
        }
        if sessions.is_empty() {
            map.remove(&user_id);
        }
        owned
    }

    pub fn active_sessions(&self, user_id: UserId) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .lock()
            .get(&user_id)
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default();
        sessions.sort();
        sessions
    }

    pub fn connection_count(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }
}
