//! Who is online.
//!
//! The registry keeps two sharded maps: registered usernames, and every
//! session that has been accepted but not yet closed (including sessions that
//! are still in their handshake). Broadcasts iterate over a cloned snapshot of
//! the second map, so no shard guard is ever held across an `.await` and
//! fan-out never blocks joins or departures for its whole duration.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

use crate::{
    error::RegistryError,
    session::{Session, SessionId},
};

pub struct Registry {
    by_name: DashMap<String, Arc<Session>>,
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a freshly accepted session to the broadcast set.
    pub fn track(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn untrack(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Claims `name` for `session`.
    ///
    /// The check and the insert happen under the same shard lock, so of two
    /// sessions racing for one name exactly one succeeds. The session's
    /// username is assigned before the key becomes visible.
    pub fn register(&self, name: &str, session: &Arc<Session>) -> Result<(), RegistryError> {
        match self.by_name.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::UsernameTaken(name.to_string())),
            Entry::Vacant(slot) => {
                // A session carries at most one name; a second claim is refused.
                if !session.assign_username(name) {
                    return Err(RegistryError::UsernameTaken(name.to_string()));
                }
                slot.insert(Arc::clone(session));
                debug!(username = name, session = session.id(), "registered username");
                Ok(())
            }
        }
    }

    /// Releases `name` if, and only if, it is held by session `id`.
    pub fn deregister(&self, name: &str, id: SessionId) -> bool {
        self.by_name
            .remove_if(name, |_, holder| holder.id() == id)
            .is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Session>> {
        self.by_name.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[cfg(test)]
    pub(crate) fn is_online(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered usernames in sorted order.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_name
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every tracked session, registered or not.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn online_count(&self) -> usize {
        self.by_name.len()
    }

    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.sessions.len()
    }
}
