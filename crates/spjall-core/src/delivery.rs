//! Fan-out helpers that combine the registry with presence.

use spjall_transport::ConnectionId;
use tracing::debug;

use crate::event::ServerEvent;
use crate::model::{ConversationId, ConversationKind, UserId};
use crate::presence::PresenceTracker;
use crate::registry::Registry;
use crate::store::{Store, StoreResult};

/// Send an event to every live connection of a user.
pub fn send_to_user(
    registry: &mut Registry,
    presence: &PresenceTracker,
    user: UserId,
    event: &ServerEvent,
) -> usize {
    registry.send_to(&presence.connections_of(user), event)
}

/// Who receives the events of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// The lobby: every authenticated connection.
    Everyone,
    /// A DM or group: the live connections of these members.
    Members(Vec<UserId>),
    /// The conversation does not exist.
    Nobody,
}

impl Audience {
    /// Look up who can see a conversation.
    ///
    /// # Errors
    ///
    /// Returns the store error if the conversation cannot be resolved.
    pub fn resolve<S: Store + ?Sized>(store: &S, conversation: ConversationId) -> StoreResult<Self> {
        Ok(match store.conversation_kind(conversation)? {
            Some(ConversationKind::Lobby) => Audience::Everyone,
            Some(_) => Audience::Members(store.members_of(conversation)?),
            None => Audience::Nobody,
        })
    }

    /// Whether a user may read and post in the conversation.
    #[must_use]
    pub fn includes(&self, user: UserId) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::Members(members) => members.contains(&user),
            Audience::Nobody => false,
        }
    }
}

/// Send an event to a conversation's audience. Offline members receive
/// nothing.
pub fn to_audience(
    registry: &mut Registry,
    presence: &PresenceTracker,
    audience: &Audience,
    event: &ServerEvent,
) -> usize {
    match audience {
        Audience::Everyone => registry.broadcast(event, None),
        Audience::Members(members) => {
            let targets: Vec<ConnectionId> = members
                .iter()
                .filter(|user| presence.is_online(**user))
                .flat_map(|user| presence.connections_of(*user))
                .collect();
            registry.send_to(&targets, event)
        }
        Audience::Nobody => {
            debug!("Delivery to unknown conversation skipped");
            0
        }
    }
}

/// Unbind a connection from its user and announce the user going offline
/// if this was their last connection.
///
/// Returns `true` if a `user_offline` was broadcast.
pub fn release(registry: &mut Registry, presence: &mut PresenceTracker, conn: ConnectionId) -> bool {
    let Some(user) = presence.user_of(conn) else {
        return false;
    };
    if let Some(c) = registry.get_mut(conn) {
        c.user = None;
    }
    if !presence.disconnect(conn) {
        return false;
    }

    registry.broadcast(&ServerEvent::UserOffline { user_id: user }, Some(conn));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::UserSummary;
    use crate::registry::tests::RecordingTransport;
    use crate::registry::{Connection, ConnectionState};
    use std::time::Instant;

    struct Fixture {
        registry: Registry,
        presence: PresenceTracker,
        transports: Vec<RecordingTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Registry::new(),
                presence: PresenceTracker::new(),
                transports: Vec::new(),
            }
        }

        fn login(&mut self, user: UserSummary) -> ConnectionId {
            let id = ConnectionId::generate();
            let transport = RecordingTransport::default();
            let mut conn = Connection::new(id, Box::new(transport.clone()), Instant::now());
            conn.state = ConnectionState::Open;
            conn.user = Some(user.clone());
            self.registry.insert(conn);
            self.presence.connect(user, id);
            self.transports.push(transport);
            id
        }

        fn received(&self, index: usize) -> usize {
            self.transports[index].sent.lock().len()
        }
    }

    #[test]
    fn test_group_reaches_online_members_only() {
        let store = MemoryStore::default();
        let a = store.add_user("a", "ta");
        let b = store.add_user("b", "tb");
        let c = store.add_user("c", "tc");
        let outsider = store.add_user("d", "td");

        let group = store.create_conversation(ConversationKind::Group, 0).unwrap();
        for user in [&a, &b, &c] {
            store.add_member(group, user.id, 0).unwrap();
        }

        let mut fx = Fixture::new();
        fx.login(a.summary());
        fx.login(a.summary());
        fx.login(b.summary());
        fx.login(outsider.summary());

        let audience = Audience::resolve(&store, group).unwrap();
        assert!(audience.includes(a.id));
        assert!(!audience.includes(outsider.id));

        let sent = to_audience(&mut fx.registry, &fx.presence, &audience, &ServerEvent::Pong {});
        assert_eq!(sent, 3);
        assert_eq!(fx.received(0), 1);
        assert_eq!(fx.received(1), 1);
        assert_eq!(fx.received(2), 1);
        assert_eq!(fx.received(3), 0);
    }

    #[test]
    fn test_lobby_reaches_everyone() {
        let store = MemoryStore::default();
        let lobby = store.lobby_id().unwrap().unwrap();

        let mut fx = Fixture::new();
        fx.login(UserSummary::new(1, "a"));
        fx.login(UserSummary::new(2, "b"));

        let audience = Audience::resolve(&store, lobby).unwrap();
        assert_eq!(audience, Audience::Everyone);
        assert_eq!(
            to_audience(&mut fx.registry, &fx.presence, &audience, &ServerEvent::Pong {}),
            2
        );
    }

    #[test]
    fn test_unknown_conversation_reaches_nobody() {
        let store = MemoryStore::default();
        let mut fx = Fixture::new();
        fx.login(UserSummary::new(1, "a"));

        let audience = Audience::resolve(&store, 999).unwrap();
        assert_eq!(audience, Audience::Nobody);
        assert!(!audience.includes(1));
        assert_eq!(
            to_audience(&mut fx.registry, &fx.presence, &audience, &ServerEvent::Pong {}),
            0
        );
        assert_eq!(fx.received(0), 0);
    }

    #[test]
    fn test_release_last_connection() {
        let mut fx = Fixture::new();
        let first = fx.login(UserSummary::new(1, "a"));
        let second = fx.login(UserSummary::new(1, "a"));
        fx.login(UserSummary::new(2, "b"));

        assert!(!release(&mut fx.registry, &mut fx.presence, first));
        assert_eq!(fx.received(2), 0);

        assert!(release(&mut fx.registry, &mut fx.presence, second));
        assert_eq!(fx.received(2), 1);
        assert!(!fx.presence.is_online(1));
        assert!(!release(&mut fx.registry, &mut fx.presence, second));
    }
}
