//! Registry of live WebSocket sessions.
//!
//! Each connection task owns its [`Session`] through an `Arc<Mutex<_>>` and
//! registers it here so the HTTP side can report on it and shutdown can
//! disconnect whatever is left.

use dashmap::DashMap;
use parking_lot::Mutex;
use signbridge_core::{
    session::{Session, SessionSnapshot},
    types::SessionId,
};
use std::sync::Arc;
use tracing::info;

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SharedSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: SharedSession) {
        let id = session.lock().id();
        self.sessions.insert(id, session);
    }

    pub fn unregister(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|entry| entry.lock().snapshot())
    }

    /// Snapshots of every session, oldest first.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| entry.value().lock().snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Disconnects and removes every session. Used on shutdown for any
    /// connection whose task has not already cleaned up.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut disconnected = 0;
        for id in ids {
            if let Some(session) = self.unregister(&id) {
                session.lock().disconnect();
                disconnected += 1;
            }
        }
        if disconnected > 0 {
            info!(disconnected, "Disconnected remaining sessions");
        }
        disconnected
    }
}
