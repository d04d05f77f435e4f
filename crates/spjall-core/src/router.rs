//! Event router.
//!
//! Parses inbound envelopes, enforces the authentication gate and runs
//! the per-event handlers against the store, the registry and presence.
//! Handlers never suspend; every reply is queued before `dispatch`
//! returns.

use spjall_transport::ConnectionId;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::delivery::{self, Audience};
use crate::event::{
    AuthPayload, CreateDmPayload, CreateGroupPayload, Envelope, ErrorCode, LoadHistoryPayload,
    SendMessagePayload, ServerEvent,
};
use crate::model::{
    now, ChatMessage, ConversationId, ConversationKind, ConversationSummary, UserId, UserSummary,
};
use crate::presence::PresenceTracker;
use crate::registry::Registry;
use crate::store::{Store, StoreError};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum message length in characters, after trimming.
    pub max_content_chars: usize,
    /// History page size when the client sends no limit.
    pub default_history_limit: i64,
    /// Upper bound for a history page.
    pub max_history_limit: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 4000,
            default_history_limit: 50,
            max_history_limit: 100,
        }
    }
}

/// Why a handler did not complete.
#[derive(Debug, Error)]
enum HandlerError {
    /// Request was refused; the message goes back to the client.
    #[error("{1}")]
    Rejected(ErrorCode, String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandlerError {
    fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        HandlerError::Rejected(code, message.into())
    }
}

type HandlerResult = Result<(), HandlerError>;

/// Mutable state a handler works on.
struct Context<'a> {
    registry: &'a mut Registry,
    presence: &'a mut PresenceTracker,
    conn: ConnectionId,
}

impl Context<'_> {
    fn reply(&mut self, event: &ServerEvent) {
        self.registry.send_event(self.conn, event);
    }
}

/// Routes client events to their handlers.
#[derive(Debug)]
pub struct Router<S> {
    store: S,
    config: RouterConfig,
}

impl<S: Store> Router<S> {
    /// Create a router with the default configuration.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_config(store, RouterConfig::default())
    }

    /// Create a router with a custom configuration.
    #[must_use]
    pub fn with_config(store: S, config: RouterConfig) -> Self {
        Self { store, config }
    }

    /// Handle one inbound text message from `conn`.
    ///
    /// Returns the error code sent back to the client, if the event was
    /// refused.
    pub fn dispatch(
        &self,
        registry: &mut Registry,
        presence: &mut PresenceTracker,
        conn: ConnectionId,
        text: &str,
    ) -> Option<ErrorCode> {
        let mut ctx = Context {
            registry,
            presence,
            conn,
        };

        let result = match Envelope::parse(text) {
            Some(envelope) => self.route(&mut ctx, &envelope),
            None => Err(HandlerError::rejected(
                ErrorCode::InvalidRequest,
                "Invalid message format",
            )),
        };

        match result {
            Ok(()) => None,
            Err(HandlerError::Rejected(code, message)) => {
                debug!(connection = %conn, code = ?code, message = %message, "Event rejected");
                ctx.reply(&ServerEvent::error(code, message));
                Some(code)
            }
            Err(HandlerError::Store(e)) => {
                error!(connection = %conn, error = %e, "Store failure while handling event");
                ctx.reply(&ServerEvent::error(
                    ErrorCode::InternalError,
                    "Internal server error",
                ));
                Some(ErrorCode::InternalError)
            }
        }
    }

    fn route(&self, ctx: &mut Context<'_>, envelope: &Envelope) -> HandlerResult {
        trace!(connection = %ctx.conn, event = %envelope.kind, "Routing event");

        if envelope.kind == "auth" {
            return self.handle_auth(ctx, payload(envelope)?);
        }

        let Some(user) = ctx.registry.get(ctx.conn).and_then(|c| c.user.clone()) else {
            return Err(HandlerError::rejected(
                ErrorCode::NotAuthenticated,
                "Not authenticated",
            ));
        };

        match envelope.kind.as_str() {
            "ping" => {
                ctx.reply(&ServerEvent::Pong {});
                Ok(())
            }
            "send_message" => self.handle_send_message(ctx, &user, payload(envelope)?),
            "create_dm" => self.handle_create_dm(ctx, &user, payload(envelope)?),
            "create_group" => self.handle_create_group(ctx, &user, payload(envelope)?),
            "load_history" => self.handle_load_history(ctx, &user, payload(envelope)?),
            "create_invite" => self.handle_create_invite(ctx, &user),
            other => Err(HandlerError::rejected(
                ErrorCode::UnknownEvent,
                format!("Unknown event type: {other}"),
            )),
        }
    }

    fn handle_auth(&self, ctx: &mut Context<'_>, payload: AuthPayload) -> HandlerResult {
        let token = payload.token.unwrap_or_default();
        if token.is_empty() {
            ctx.reply(&ServerEvent::AuthError {
                message: "Token is required".into(),
            });
            return Ok(());
        }

        let Some(user) = self.store.find_user_by_token(&token)? else {
            debug!(connection = %ctx.conn, "Rejected invalid token");
            ctx.reply(&ServerEvent::AuthError {
                message: "Invalid token".into(),
            });
            return Ok(());
        };
        let summary = user.summary();
        let conversations = self.conversations_for(user.id)?;

        if ctx
            .presence
            .user_of(ctx.conn)
            .is_some_and(|bound| bound != user.id)
        {
            delivery::release(ctx.registry, ctx.presence, ctx.conn);
        }

        if let Some(conn) = ctx.registry.get_mut(ctx.conn) {
            conn.user = Some(summary.clone());
        }
        let came_online = ctx.presence.connect(summary.clone(), ctx.conn);
        info!(connection = %ctx.conn, user = user.id, nickname = %user.nickname, "Authenticated");

        ctx.reply(&ServerEvent::AuthOk {
            user: summary.clone(),
            conversations,
            online_users: ctx.presence.online_users(),
        });

        if came_online {
            ctx.registry
                .broadcast(&ServerEvent::UserOnline { user: summary }, Some(ctx.conn));
        }
        Ok(())
    }

    fn handle_send_message(
        &self,
        ctx: &mut Context<'_>,
        user: &UserSummary,
        payload: SendMessagePayload,
    ) -> HandlerResult {
        let conversation = payload.conversation_id.unwrap_or(0);
        if conversation <= 0 {
            return Err(HandlerError::rejected(
                ErrorCode::InvalidConversation,
                "Invalid conversation",
            ));
        }

        let content = payload.content.as_deref().unwrap_or_default().trim();
        if content.is_empty() {
            return Err(HandlerError::rejected(
                ErrorCode::EmptyContent,
                "Message cannot be empty",
            ));
        }
        if content.chars().count() > self.config.max_content_chars {
            return Err(HandlerError::rejected(
                ErrorCode::ContentTooLong,
                format!(
                    "Message too long (max {} chars)",
                    self.config.max_content_chars
                ),
            ));
        }

        // Resolved before the insert so a stored message is always delivered.
        let audience = Audience::resolve(&self.store, conversation)?;
        if !audience.includes(user.id) {
            return Err(not_member());
        }

        let created_at = now();
        let id = self
            .store
            .insert_message(conversation, user.id, content, created_at)?;
        let message = ChatMessage {
            id,
            conversation_id: conversation,
            user_id: user.id,
            content: content.to_string(),
            created_at,
        };

        let delivered = delivery::to_audience(
            ctx.registry,
            ctx.presence,
            &audience,
            &ServerEvent::Message(message),
        );
        debug!(connection = %ctx.conn, conversation, message = id, delivered, "Message sent");
        Ok(())
    }

    fn handle_create_dm(
        &self,
        ctx: &mut Context<'_>,
        user: &UserSummary,
        payload: CreateDmPayload,
    ) -> HandlerResult {
        let target = payload.user_id.unwrap_or(0);
        if target <= 0 {
            return Err(HandlerError::rejected(ErrorCode::InvalidUser, "Invalid user"));
        }
        if target == user.id {
            return Err(HandlerError::rejected(
                ErrorCode::InvalidUser,
                "Cannot create DM with yourself",
            ));
        }
        let Some(target) = self.store.find_user_by_id(target)? else {
            return Err(HandlerError::rejected(ErrorCode::InvalidUser, "User not found"));
        };
        let target = target.summary();

        if let Some(existing) = self.store.find_dm_between(user.id, target.id)? {
            ctx.reply(&ServerEvent::ConversationCreated {
                conversation: ConversationSummary {
                    id: existing,
                    kind: ConversationKind::Dm,
                    members: vec![target],
                },
            });
            return Ok(());
        }

        let created_at = now();
        let id = self
            .store
            .create_conversation(ConversationKind::Dm, created_at)?;
        self.store.add_member(id, user.id, created_at)?;
        self.store.add_member(id, target.id, created_at)?;
        info!(conversation = id, user = user.id, target = target.id, "Created DM");

        for (recipient, other) in [(user, &target), (&target, user)] {
            let event = ServerEvent::ConversationCreated {
                conversation: ConversationSummary {
                    id,
                    kind: ConversationKind::Dm,
                    members: vec![other.clone()],
                },
            };
            delivery::send_to_user(ctx.registry, ctx.presence, recipient.id, &event);
        }
        Ok(())
    }

    fn handle_create_group(
        &self,
        ctx: &mut Context<'_>,
        user: &UserSummary,
        payload: CreateGroupPayload,
    ) -> HandlerResult {
        if payload.user_ids.len() < 2 {
            return Err(HandlerError::rejected(
                ErrorCode::InvalidRequest,
                "Group requires at least 2 other users",
            ));
        }

        let mut seen = BTreeSet::new();
        let ids: Vec<UserId> = std::iter::once(user.id)
            .chain(payload.user_ids)
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.len() < 3 {
            return Err(HandlerError::rejected(
                ErrorCode::InvalidRequest,
                "Group requires at least 3 total members",
            ));
        }

        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.find_user_by_id(id)? {
                Some(member) => members.push(member.summary()),
                None => {
                    return Err(HandlerError::rejected(
                        ErrorCode::InvalidUser,
                        format!("User {id} not found"),
                    ))
                }
            }
        }

        let created_at = now();
        let id = self
            .store
            .create_conversation(ConversationKind::Group, created_at)?;
        for member in &members {
            self.store.add_member(id, member.id, created_at)?;
        }
        info!(conversation = id, user = user.id, members = members.len(), "Created group");

        for member in &members {
            let event = ServerEvent::ConversationCreated {
                conversation: ConversationSummary {
                    id,
                    kind: ConversationKind::Group,
                    members: members
                        .iter()
                        .filter(|other| other.id != member.id)
                        .cloned()
                        .collect(),
                },
            };
            delivery::send_to_user(ctx.registry, ctx.presence, member.id, &event);
        }
        Ok(())
    }

    fn handle_load_history(
        &self,
        ctx: &mut Context<'_>,
        user: &UserSummary,
        payload: LoadHistoryPayload,
    ) -> HandlerResult {
        let conversation = payload.conversation_id.unwrap_or(0);
        if conversation <= 0 || !self.can_access(user.id, conversation)? {
            return Err(not_member());
        }

        let before = payload.before.unwrap_or(i64::MAX);
        let limit = payload
            .limit
            .unwrap_or(self.config.default_history_limit)
            .clamp(1, self.config.max_history_limit.max(1));
        let limit = usize::try_from(limit).unwrap_or(1);

        let mut messages = self.store.query_messages(conversation, before, limit + 1)?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        messages.reverse();

        ctx.reply(&ServerEvent::History {
            conversation_id: conversation,
            messages,
            has_more,
        });
        Ok(())
    }

    fn handle_create_invite(&self, ctx: &mut Context<'_>, user: &UserSummary) -> HandlerResult {
        let code = self.store.create_invite(user.id)?;
        let url = self.store.invite_url(&code);
        ctx.reply(&ServerEvent::InviteCreated { code, url });
        Ok(())
    }

    /// Lobby is open to every authenticated user; other conversations
    /// need membership.
    fn can_access(&self, user: UserId, conversation: ConversationId) -> Result<bool, StoreError> {
        match self.store.conversation_kind(conversation)? {
            Some(ConversationKind::Lobby) => Ok(true),
            Some(_) => self.store.is_member(conversation, user),
            None => Ok(false),
        }
    }

    /// Lobby first, then the user's conversations newest first.
    fn conversations_for(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut conversations = Vec::new();
        if let Some(lobby) = self.store.lobby_id()? {
            conversations.push(ConversationSummary {
                id: lobby,
                kind: ConversationKind::Lobby,
                members: Vec::new(),
            });
        }

        for (id, kind) in self.store.conversations_of(user)? {
            let mut members = Vec::new();
            for member in self.store.members_of(id)? {
                if member == user {
                    continue;
                }
                if let Some(found) = self.store.find_user_by_id(member)? {
                    members.push(found.summary());
                }
            }
            conversations.push(ConversationSummary { id, kind, members });
        }
        Ok(conversations)
    }
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, HandlerError> {
    envelope.payload().map_err(|e| {
        debug!(event = %envelope.kind, error = %e, "Malformed payload");
        HandlerError::rejected(ErrorCode::InvalidRequest, "Invalid message format")
    })
}

fn not_member() -> HandlerError {
    HandlerError::rejected(ErrorCode::NotMember, "Not a member of this conversation")
}
