//! Persistence interface consumed by the router.
//!
//! The chat core never owns the schema; it reads users and conversations
//! and appends messages through this trait. [`MemoryStore`](crate::memory::MemoryStore)
//! is the bundled implementation.

use std::sync::Arc;
use thiserror::Error;

use crate::model::{
    ChatMessage, ConversationId, ConversationKind, MessageId, Timestamp, User, UserId,
};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not serve the request.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Referenced conversation does not exist.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// Referenced user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence operations used by the router.
pub trait Store: Send {
    /// Look up a user by bearer token.
    fn find_user_by_token(&self, token: &str) -> StoreResult<Option<User>>;

    /// Look up a user by id.
    fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Id of the process-wide lobby.
    fn lobby_id(&self) -> StoreResult<Option<ConversationId>>;

    /// Kind of a conversation, or `None` if it does not exist.
    fn conversation_kind(&self, id: ConversationId) -> StoreResult<Option<ConversationKind>>;

    /// Whether the user is an explicit member of the conversation.
    fn is_member(&self, conversation: ConversationId, user: UserId) -> StoreResult<bool>;

    /// Explicit members of a conversation.
    fn members_of(&self, conversation: ConversationId) -> StoreResult<Vec<UserId>>;

    /// Non-lobby conversations the user belongs to, newest first.
    fn conversations_of(&self, user: UserId)
        -> StoreResult<Vec<(ConversationId, ConversationKind)>>;

    /// Existing DM between two users, in either order.
    fn find_dm_between(&self, a: UserId, b: UserId) -> StoreResult<Option<ConversationId>>;

    /// Create an empty conversation.
    fn create_conversation(
        &self,
        kind: ConversationKind,
        created_at: Timestamp,
    ) -> StoreResult<ConversationId>;

    /// Add a member to a conversation.
    fn add_member(
        &self,
        conversation: ConversationId,
        user: UserId,
        joined_at: Timestamp,
    ) -> StoreResult<()>;

    /// Append a message and return its id.
    fn insert_message(
        &self,
        conversation: ConversationId,
        user: UserId,
        content: &str,
        created_at: Timestamp,
    ) -> StoreResult<MessageId>;

    /// Messages created strictly before `before`, newest first, at most `limit`.
    fn query_messages(
        &self,
        conversation: ConversationId,
        before: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>>;

    /// Create an invite code on behalf of a user.
    fn create_invite(&self, creator: UserId) -> StoreResult<String>;

    /// Redemption URL for an invite code.
    fn invite_url(&self, code: &str) -> String;
}

impl<T: Store + Sync + ?Sized> Store for Arc<T> {
    fn find_user_by_token(&self, token: &str) -> StoreResult<Option<User>> {
        (**self).find_user_by_token(token)
    }

    fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        (**self).find_user_by_id(id)
    }

    fn lobby_id(&self) -> StoreResult<Option<ConversationId>> {
        (**self).lobby_id()
    }

    fn conversation_kind(&self, id: ConversationId) -> StoreResult<Option<ConversationKind>> {
        (**self).conversation_kind(id)
    }

    fn is_member(&self, conversation: ConversationId, user: UserId) -> StoreResult<bool> {
        (**self).is_member(conversation, user)
    }

    fn members_of(&self, conversation: ConversationId) -> StoreResult<Vec<UserId>> {
        (**self).members_of(conversation)
    }

    fn conversations_of(
        &self,
        user: UserId,
    ) -> StoreResult<Vec<(ConversationId, ConversationKind)>> {
        (**self).conversations_of(user)
    }

    fn find_dm_between(&self, a: UserId, b: UserId) -> StoreResult<Option<ConversationId>> {
        (**self).find_dm_between(a, b)
    }

    fn create_conversation(
        &self,
        kind: ConversationKind,
        created_at: Timestamp,
    ) -> StoreResult<ConversationId> {
        (**self).create_conversation(kind, created_at)
    }

    fn add_member(
        &self,
        conversation: ConversationId,
        user: UserId,
        joined_at: Timestamp,
    ) -> StoreResult<()> {
        (**self).add_member(conversation, user, joined_at)
    }

    fn insert_message(
        &self,
        conversation: ConversationId,
        user: UserId,
        content: &str,
        created_at: Timestamp,
    ) -> StoreResult<MessageId> {
        (**self).insert_message(conversation, user, content, created_at)
    }

    fn query_messages(
        &self,
        conversation: ConversationId,
        before: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        (**self).query_messages(conversation, before, limit)
    }

    fn create_invite(&self, creator: UserId) -> StoreResult<String> {
        (**self).create_invite(creator)
    }

    fn invite_url(&self, code: &str) -> String {
        (**self).invite_url(code)
    }
}
