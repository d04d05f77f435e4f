//! In-memory [`Store`] implementation.
//!
//! Holds users, conversations, memberships, messages and invites in
//! lock-guarded maps. A lobby conversation is created on construction.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::model::{
    now, ChatMessage, ConversationId, ConversationKind, MessageId, Timestamp, User, UserId,
};
use crate::store::{Store, StoreError, StoreResult};

/// Length of generated invite codes.
pub const INVITE_CODE_LENGTH: usize = 8;

/// Invite code alphabet; no I, O, 0 or 1.
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// An invite code record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub code: String,
    pub created_by: Option<UserId>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct ConversationRecord {
    kind: ConversationKind,
    created_at: Timestamp,
}

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<UserId, User>,
    conversations: BTreeMap<ConversationId, ConversationRecord>,
    members: HashMap<ConversationId, BTreeSet<UserId>>,
    messages: Vec<ChatMessage>,
    invites: HashMap<String, Invite>,
    lobby: Option<ConversationId>,
    next_user_id: UserId,
    next_conversation_id: ConversationId,
    next_message_id: MessageId,
}

impl Inner {
    fn conversation(&self, id: ConversationId) -> StoreResult<&ConversationRecord> {
        self.conversations
            .get(&id)
            .ok_or(StoreError::ConversationNotFound(id))
    }

    fn insert_conversation(&mut self, kind: ConversationKind, created_at: Timestamp) -> ConversationId {
        self.next_conversation_id += 1;
        let id = self.next_conversation_id;
        self.conversations
            .insert(id, ConversationRecord { kind, created_at });
        id
    }
}

/// Store backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    invite_base_url: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

impl MemoryStore {
    /// Create a store whose invite links point at `invite_base_url`.
    #[must_use]
    pub fn new(invite_base_url: impl Into<String>) -> Self {
        let mut inner = Inner::default();
        let lobby = inner.insert_conversation(ConversationKind::Lobby, now());
        inner.lobby = Some(lobby);

        Self {
            inner: RwLock::new(inner),
            invite_base_url: invite_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Register a user with an explicit token.
    pub fn add_user(&self, nickname: impl Into<String>, token: impl Into<String>) -> User {
        let mut inner = self.inner.write();
        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            nickname: nickname.into(),
            token: token.into(),
        };
        inner.users.insert(user.id, user.clone());
        debug!(user = user.id, nickname = %user.nickname, "Registered user");
        user
    }

    /// Look up an invite by code, case-insensitively.
    #[must_use]
    pub fn invite(&self, code: &str) -> Option<Invite> {
        self.inner
            .read()
            .invites
            .get(&code.to_ascii_uppercase())
            .cloned()
    }

    /// Number of conversations, including the lobby.
    #[cfg(test)]
    pub fn conversation_count(&self) -> usize {
        self.inner.read().conversations.len()
    }

    /// Number of stored messages.
    #[cfg(test)]
    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LENGTH)
        .map(|_| char::from(INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())]))
        .collect()
}

impl Store for MemoryStore {
    fn find_user_by_token(&self, token: &str) -> StoreResult<Option<User>> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .inner
            .read()
            .users
            .values()
            .find(|user| user.token == token)
            .cloned())
    }

    fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.inner.read().users.get(&id).cloned())
    }

    fn lobby_id(&self) -> StoreResult<Option<ConversationId>> {
        Ok(self.inner.read().lobby)
    }

    fn conversation_kind(&self, id: ConversationId) -> StoreResult<Option<ConversationKind>> {
        Ok(self.inner.read().conversations.get(&id).map(|c| c.kind))
    }

    fn is_member(&self, conversation: ConversationId, user: UserId) -> StoreResult<bool> {
        Ok(self
            .inner
            .read()
            .members
            .get(&conversation)
            .is_some_and(|members| members.contains(&user)))
    }

    fn members_of(&self, conversation: ConversationId) -> StoreResult<Vec<UserId>> {
        Ok(self
            .inner
            .read()
            .members
            .get(&conversation)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    fn conversations_of(
        &self,
        user: UserId,
    ) -> StoreResult<Vec<(ConversationId, ConversationKind)>> {
        let inner = self.inner.read();
        let mut found: Vec<(ConversationId, ConversationRecord)> = inner
            .members
            .iter()
            .filter(|(_, members)| members.contains(&user))
            .filter_map(|(id, _)| inner.conversations.get(id).map(|record| (*id, *record)))
            .filter(|(_, record)| record.kind != ConversationKind::Lobby)
            .collect();

        found.sort_by(|a, b| (b.1.created_at, b.0).cmp(&(a.1.created_at, a.0)));
        Ok(found.into_iter().map(|(id, record)| (id, record.kind)).collect())
    }

    fn find_dm_between(&self, a: UserId, b: UserId) -> StoreResult<Option<ConversationId>> {
        let inner = self.inner.read();
        Ok(inner
            .conversations
            .iter()
            .filter(|(_, record)| record.kind == ConversationKind::Dm)
            .map(|(id, _)| *id)
            .find(|id| {
                inner
                    .members
                    .get(id)
                    .is_some_and(|members| members.contains(&a) && members.contains(&b))
            }))
    }

    fn create_conversation(
        &self,
        kind: ConversationKind,
        created_at: Timestamp,
    ) -> StoreResult<ConversationId> {
        let mut inner = self.inner.write();
        if kind == ConversationKind::Lobby {
            if let Some(lobby) = inner.lobby {
                return Ok(lobby);
            }
        }
        let id = inner.insert_conversation(kind, created_at);
        if kind == ConversationKind::Lobby {
            inner.lobby = Some(id);
        }
        debug!(conversation = id, kind = %kind, "Created conversation");
        Ok(id)
    }

    fn add_member(
        &self,
        conversation: ConversationId,
        user: UserId,
        _joined_at: Timestamp,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.conversation(conversation)?;
        if !inner.users.contains_key(&user) {
            return Err(StoreError::UserNotFound(user));
        }
        inner.members.entry(conversation).or_default().insert(user);
        Ok(())
    }

    fn insert_message(
        &self,
        conversation: ConversationId,
        user: UserId,
        content: &str,
        created_at: Timestamp,
    ) -> StoreResult<MessageId> {
        let mut inner = self.inner.write();
        inner.conversation(conversation)?;
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        inner.messages.push(ChatMessage {
            id,
            conversation_id: conversation,
            user_id: user,
            content: content.to_string(),
            created_at,
        });
        Ok(id)
    }

    fn query_messages(
        &self,
        conversation: ConversationId,
        before: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        let inner = self.inner.read();
        let mut messages: Vec<ChatMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation && m.created_at < before)
            .cloned()
            .collect();

        messages.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        messages.truncate(limit);
        Ok(messages)
    }

    fn create_invite(&self, creator: UserId) -> StoreResult<String> {
        let mut inner = self.inner.write();
        let mut code = generate_code();
        while inner.invites.contains_key(&code) {
            code = generate_code();
        }

        inner.invites.insert(
            code.clone(),
            Invite {
                code: code.clone(),
                created_by: Some(creator),
                created_at: now(),
            },
        );
        debug!(user = creator, "Created invite");
        Ok(code)
    }

    fn invite_url(&self, code: &str) -> String {
        format!("{}/join/{}", self.invite_base_url, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobby_exists() {
        let store = MemoryStore::default();
        let lobby = store.lobby_id().unwrap().unwrap();
        assert_eq!(
            store.conversation_kind(lobby).unwrap(),
            Some(ConversationKind::Lobby)
        );
        assert_eq!(
            store.create_conversation(ConversationKind::Lobby, 0).unwrap(),
            lobby
        );
        assert_eq!(store.conversation_count(), 1);
    }

    #[test]
    fn test_users() {
        let store = MemoryStore::default();
        let alice = store.add_user("alice", "tok-a");

        assert_eq!(store.find_user_by_token("tok-a").unwrap(), Some(alice.clone()));
        assert_eq!(store.find_user_by_token("").unwrap(), None);
        assert_eq!(store.find_user_by_token("nope").unwrap(), None);
        assert_eq!(store.find_user_by_id(alice.id).unwrap(), Some(alice));
        assert_eq!(store.find_user_by_id(999).unwrap(), None);
    }

    #[test]
    fn test_dm_lookup_is_unordered() {
        let store = MemoryStore::default();
        let a = store.add_user("a", "ta");
        let b = store.add_user("b", "tb");
        let c = store.add_user("c", "tc");

        let dm = store.create_conversation(ConversationKind::Dm, 10).unwrap();
        store.add_member(dm, a.id, 10).unwrap();
        store.add_member(dm, b.id, 10).unwrap();

        assert_eq!(store.find_dm_between(a.id, b.id).unwrap(), Some(dm));
        assert_eq!(store.find_dm_between(b.id, a.id).unwrap(), Some(dm));
        assert_eq!(store.find_dm_between(a.id, c.id).unwrap(), None);
    }

    #[test]
    fn test_conversations_newest_first() {
        let store = MemoryStore::default();
        let a = store.add_user("a", "ta");

        let older = store.create_conversation(ConversationKind::Group, 10).unwrap();
        let newer = store.create_conversation(ConversationKind::Dm, 20).unwrap();
        store.add_member(older, a.id, 10).unwrap();
        store.add_member(newer, a.id, 20).unwrap();

        assert_eq!(
            store.conversations_of(a.id).unwrap(),
            vec![
                (newer, ConversationKind::Dm),
                (older, ConversationKind::Group)
            ]
        );
    }

    #[test]
    fn test_add_member_unknown() {
        let store = MemoryStore::default();
        let a = store.add_user("a", "ta");
        assert!(matches!(
            store.add_member(999, a.id, 0),
            Err(StoreError::ConversationNotFound(999))
        ));

        let group = store.create_conversation(ConversationKind::Group, 0).unwrap();
        assert!(matches!(
            store.add_member(group, 999, 0),
            Err(StoreError::UserNotFound(999))
        ));
    }

    #[test]
    fn test_query_messages_before_and_order() {
        let store = MemoryStore::default();
        let lobby = store.lobby_id().unwrap().unwrap();

        for t in [10, 20, 30, 40] {
            store
                .insert_message(lobby, 1, &format!("at {t}"), t)
                .unwrap();
        }

        let page = store.query_messages(lobby, 40, 2).unwrap();
        let times: Vec<_> = page.iter().map(|m| m.created_at).collect();
        assert_eq!(times, vec![30, 20]);

        assert!(store.query_messages(lobby, 10, 10).unwrap().is_empty());
    }

    #[test]
    fn test_invites() {
        let store = MemoryStore::new("https://chat.example/");
        let code = store.create_invite(3).unwrap();

        assert_eq!(code.len(), INVITE_CODE_LENGTH);
        assert!(code.bytes().all(|b| INVITE_ALPHABET.contains(&b)));
        assert_eq!(
            store.invite_url(&code),
            format!("https://chat.example/join/{code}")
        );

        let invite = store.invite(&code.to_lowercase()).unwrap();
        assert_eq!(invite.created_by, Some(3));
    }
}
