//! Directory - the single source of truth for who is online
//!
//! Maps user identity to connection handle, display name, role, and current
//! room. Entries exist only while a connection is bound; re-registration
//! under the same identity rebinds the handle (last registration wins).

use std::collections::HashMap;

use crate::models::{ConnId, PresenceEntry, User, UserId};

#[derive(Debug, Default)]
pub struct Directory {
    users: HashMap<UserId, User>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Bind an identity to a connection, superseding any prior binding.
    /// Returns the superseded entry, if there was one.
    pub fn register(&mut self, user: User) -> Option<User> {
        let prior = self.users.insert(user.identity.clone(), user);
        if let Some(ref old) = prior {
            tracing::info!(identity = %old.identity, old_conn = %old.conn, "Superseded prior registration");
        }
        prior
    }

    /// Remove an identity entirely. Must run after room membership cleanup
    /// so room-removal notices can still resolve the display name.
    pub fn unregister(&mut self, identity: &str) -> Option<User> {
        self.users.remove(identity)
    }

    /// Connection handle for an identity; `None` means offline and the
    /// caller drops the message silently.
    pub fn resolve(&self, identity: &str) -> Option<ConnId> {
        self.users.get(identity).map(|u| u.conn)
    }

    pub fn get(&self, identity: &str) -> Option<&User> {
        self.users.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut User> {
        self.users.get_mut(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.users.contains_key(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Full presence snapshot, recomputed fresh on every call
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .users
            .values()
            .map(|u| PresenceEntry {
                identity: u.identity.clone(),
                display_name: u.display_name.clone(),
                role: u.role,
                online: true,
            })
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }
}
