//! Session registry.
//!
//! The process-wide map from session id to the handle of the task that owns
//! the session. Entries are inserted by the manager after a successful spawn
//! and removed exactly once, by the session's own teardown.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::actor::SessionCommand;
use super::error::SessionId;

/// What the registry knows about a live session without asking its task.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand>,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Creation time in Unix milliseconds.
    pub created_at: u64,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("pid", &self.pid)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Shared, cloneable view of all live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session. Returns false, leaving the map untouched, if the
    /// id is already taken.
    pub fn insert(&self, id: SessionId, handle: SessionHandle) -> bool {
        match self.sessions.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Removes a session, returning its handle if it was present.
    pub fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    /// Returns a clone of a session's handle.
    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all live sessions, oldest first.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut entries: Vec<(SessionId, u64)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().created_at))
            .collect();
        entries.sort_by_key(|(_, created_at)| *created_at);
        entries.into_iter().map(|(id, _)| id).collect()
    }

    /// Shell process ids of all live sessions.
    pub fn pids(&self) -> Vec<u32> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().pid)
            .collect()
    }
}
