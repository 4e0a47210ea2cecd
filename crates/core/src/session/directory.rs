use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::media::rtcp::ntp_now;
use crate::session::ClientSession;

/// Server-wide registry of sessions that have been assigned an RTSP id.
///
/// Ids are minted from the NTP clock and bumped until unique, all under the
/// write lock, so two sessions can never be given the same id.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    sessions: Arc<RwLock<HashMap<String, Arc<ClientSession>>>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id and register `session` under it.
    pub fn register(&self, session: Arc<ClientSession>) -> String {
        let mut sessions = self.sessions.write();
        let mut candidate = ntp_now();
        let mut id = format!("{:016X}", candidate);
        while sessions.contains_key(&id) {
            candidate = candidate.wrapping_add(1);
            id = format!("{:016X}", candidate);
        }
        sessions.insert(id.clone(), session);
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session registered");
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session. Only the first call for a given id returns it.
    pub fn remove(&self, id: &str) -> Option<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().values().cloned().collect()
    }
}
