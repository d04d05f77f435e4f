//! Presence tracking.
//!
//! A user is online while at least one authenticated connection is bound
//! to them. The tracker only reports transitions; broadcasting
//! `user_online` / `user_offline` is left to the caller.

use spjall_transport::ConnectionId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::model::{UserId, UserSummary};

#[derive(Debug)]
struct OnlineUser {
    summary: UserSummary,
    connections: BTreeSet<ConnectionId>,
}

/// Maps users to their live connections.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: BTreeMap<UserId, OnlineUser>,
    bindings: HashMap<ConnectionId, UserId>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a user.
    ///
    /// Returns `true` if the user just came online. A connection already
    /// bound to another user is moved; callers should [`disconnect`] it
    /// first to observe that user's offline transition.
    ///
    /// [`disconnect`]: Self::disconnect
    pub fn connect(&mut self, user: UserSummary, conn: ConnectionId) -> bool {
        if let Some(previous) = self.bindings.get(&conn).copied() {
            if previous == user.id {
                return false;
            }
            self.disconnect(conn);
        }

        self.bindings.insert(conn, user.id);
        let user_id = user.id;
        let entry = self.users.entry(user_id).or_insert_with(|| OnlineUser {
            summary: user,
            connections: BTreeSet::new(),
        });
        let came_online = entry.connections.is_empty();
        entry.connections.insert(conn);

        if came_online {
            debug!(user = user_id, connection = %conn, "User online");
        }
        came_online
    }

    /// Unbind a connection.
    ///
    /// Returns `true` if its user just went offline. Unbound connections
    /// are ignored.
    pub fn disconnect(&mut self, conn: ConnectionId) -> bool {
        let Some(user_id) = self.bindings.remove(&conn) else {
            return false;
        };

        let Some(entry) = self.users.get_mut(&user_id) else {
            return false;
        };
        entry.connections.remove(&conn);
        if !entry.connections.is_empty() {
            return false;
        }

        self.users.remove(&user_id);
        debug!(user = user_id, connection = %conn, "User offline");
        true
    }

    /// Whether the user has any live connection.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.users.contains_key(&user)
    }

    /// Live connections of a user.
    #[must_use]
    pub fn connections_of(&self, user: UserId) -> Vec<ConnectionId> {
        self.users
            .get(&user)
            .map(|entry| entry.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Online users ordered by id.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserSummary> {
        self.users.values().map(|entry| entry.summary.clone()).collect()
    }

    /// User bound to a connection.
    #[must_use]
    pub fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.bindings.get(&conn).copied()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    /// Number of authenticated connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserSummary {
        UserSummary::new(1, "alice")
    }

    #[test]
    fn test_single_connection() {
        let mut presence = PresenceTracker::new();
        let conn = ConnectionId::new(1);

        assert!(presence.connect(alice(), conn));
        assert!(presence.is_online(1));
        assert_eq!(presence.user_of(conn), Some(1));

        assert!(presence.disconnect(conn));
        assert!(!presence.is_online(1));
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn test_online_until_last_connection() {
        let mut presence = PresenceTracker::new();
        let conns: Vec<_> = (1..=3).map(ConnectionId::new).collect();

        assert!(presence.connect(alice(), conns[0]));
        assert!(!presence.connect(alice(), conns[1]));
        assert!(!presence.connect(alice(), conns[2]));
        assert_eq!(presence.connections_of(1), conns);

        assert!(!presence.disconnect(conns[1]));
        assert!(!presence.disconnect(conns[0]));
        assert!(presence.is_online(1));
        assert!(presence.disconnect(conns[2]));
        assert!(!presence.is_online(1));
    }

    #[test]
    fn test_disconnect_unknown_and_twice() {
        let mut presence = PresenceTracker::new();
        let conn = ConnectionId::new(9);

        assert!(!presence.disconnect(conn));
        presence.connect(alice(), conn);
        assert!(presence.disconnect(conn));
        assert!(!presence.disconnect(conn));
    }

    #[test]
    fn test_reconnect_same_user_is_noop() {
        let mut presence = PresenceTracker::new();
        let conn = ConnectionId::new(1);

        assert!(presence.connect(alice(), conn));
        assert!(!presence.connect(alice(), conn));
        assert_eq!(presence.connections_of(1), vec![conn]);
        assert_eq!(presence.connection_count(), 1);
    }

    #[test]
    fn test_rebind_to_other_user() {
        let mut presence = PresenceTracker::new();
        let conn = ConnectionId::new(1);

        presence.connect(alice(), conn);
        assert!(presence.connect(UserSummary::new(2, "bob"), conn));
        assert!(!presence.is_online(1));
        assert!(presence.is_online(2));
    }

    #[test]
    fn test_online_users_sorted() {
        let mut presence = PresenceTracker::new();
        presence.connect(UserSummary::new(5, "eve"), ConnectionId::new(1));
        presence.connect(UserSummary::new(2, "bob"), ConnectionId::new(2));

        let ids: Vec<_> = presence.online_users().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![2, 5]);
    }
}
