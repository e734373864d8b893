//! Shared table of live relayed sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::relay::ConnectionId;
use crate::target::Target;

/// What the server knows about one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Remote address of the WebSocket client.
    pub peer: SocketAddr,
    /// TCP endpoint being relayed to.
    pub target: Target,
    /// When the session was accepted.
    pub opened_at: Instant,
}

/// Cloneable handle to the session table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<ConnectionId, SessionInfo>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, SessionInfo>> {
        // A panicked session task cannot leave the map half-updated
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new session.
    pub fn insert(&self, id: ConnectionId, peer: SocketAddr, target: Target) {
        self.lock().insert(
            id,
            SessionInfo {
                peer,
                target,
                opened_at: Instant::now(),
            },
        );
    }

    /// Forget a session. Returns its info if it was registered.
    pub fn remove(&self, id: &ConnectionId) -> Option<SessionInfo> {
        self.lock().remove(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the table, sorted by session ID.
    pub fn snapshot(&self) -> Vec<(ConnectionId, SessionInfo)> {
        let mut sessions: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }
}
