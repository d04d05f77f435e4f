//! JSON event envelopes exchanged with clients.
//!
//! Every text frame carries one object `{"type": ..., "payload": {...}}`.
//! Inbound envelopes are parsed in two steps: the envelope first, then the
//! payload for the specific event type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ChatMessage, ConversationId, ConversationSummary, Timestamp, UserId, UserSummary};

/// Inbound event envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Parse an envelope from frame text.
    ///
    /// Returns `None` for anything that is not an object with a string
    /// `type`. A missing or null payload becomes an empty object.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut envelope: Envelope = serde_json::from_str(text).ok()?;
        if envelope.payload.is_null() {
            envelope.payload = Value::Object(serde_json::Map::new());
        }
        Some(envelope)
    }

    /// Decode the payload into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the payload does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// `auth` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthPayload {
    pub token: Option<String>,
}

/// `send_message` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendMessagePayload {
    pub conversation_id: Option<ConversationId>,
    pub content: Option<String>,
}

/// `create_dm` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateDmPayload {
    pub user_id: Option<UserId>,
}

/// `create_group` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateGroupPayload {
    pub user_ids: Vec<UserId>,
}

/// `load_history` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoadHistoryPayload {
    pub conversation_id: Option<ConversationId>,
    pub before: Option<Timestamp>,
    pub limit: Option<i64>,
}

/// Machine-readable error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    NotAuthenticated,
    UnknownEvent,
    InvalidConversation,
    EmptyContent,
    ContentTooLong,
    NotMember,
    InvalidUser,
    InternalError,
}

/// Outbound events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthOk {
        user: UserSummary,
        conversations: Vec<ConversationSummary>,
        online_users: Vec<UserSummary>,
    },
    AuthError {
        message: String,
    },
    Pong {},
    Error {
        code: ErrorCode,
        message: String,
    },
    Message(ChatMessage),
    ConversationCreated {
        conversation: ConversationSummary,
    },
    History {
        conversation_id: ConversationId,
        messages: Vec<ChatMessage>,
        has_more: bool,
    },
    InviteCreated {
        code: String,
        url: String,
    },
    UserOnline {
        user: UserSummary,
    },
    UserOffline {
        user_id: UserId,
    },
}

impl ServerEvent {
    /// Build an `error` event.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AuthOk { .. } => "auth_ok",
            ServerEvent::AuthError { .. } => "auth_error",
            ServerEvent::Pong {} => "pong",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Message(_) => "message",
            ServerEvent::ConversationCreated { .. } => "conversation_created",
            ServerEvent::History { .. } => "history",
            ServerEvent::InviteCreated { .. } => "invite_created",
            ServerEvent::UserOnline { .. } => "user_online",
            ServerEvent::UserOffline { .. } => "user_offline",
        }
    }

    /// Serialize to the JSON text sent in a frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConversationKind;
    use serde_json::json;

    fn value(event: &ServerEvent) -> Value {
        serde_json::from_str(&event.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_envelope() {
        let env = Envelope::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert_eq!(env.payload, json!({}));

        let env = Envelope::parse(r#"{"type":"auth","payload":null}"#).unwrap();
        assert_eq!(env.payload, json!({}));

        let env = Envelope::parse(r#"{"type":"auth","payload":{"token":"t"}}"#).unwrap();
        let auth: AuthPayload = env.payload().unwrap();
        assert_eq!(auth.token.as_deref(), Some("t"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Envelope::parse("not json").is_none());
        assert!(Envelope::parse("[1,2]").is_none());
        assert!(Envelope::parse(r#"{"payload":{}}"#).is_none());
        assert!(Envelope::parse(r#"{"type":5}"#).is_none());
    }

    #[test]
    fn test_payload_defaults() {
        let env = Envelope::parse(r#"{"type":"load_history","payload":{}}"#).unwrap();
        let history: LoadHistoryPayload = env.payload().unwrap();
        assert_eq!(history.conversation_id, None);
        assert_eq!(history.limit, None);

        let env = Envelope::parse(r#"{"type":"create_group","payload":{}}"#).unwrap();
        let group: CreateGroupPayload = env.payload().unwrap();
        assert!(group.user_ids.is_empty());
    }

    #[test]
    fn test_event_wire_shape() {
        assert_eq!(value(&ServerEvent::Pong {}), json!({"type": "pong", "payload": {}}));

        assert_eq!(
            value(&ServerEvent::error(ErrorCode::NotMember, "Not a member of this conversation")),
            json!({
                "type": "error",
                "payload": {"code": "NOT_MEMBER", "message": "Not a member of this conversation"}
            })
        );

        assert_eq!(
            value(&ServerEvent::UserOffline { user_id: 4 }),
            json!({"type": "user_offline", "payload": {"user_id": 4}})
        );
    }

    #[test]
    fn test_message_event_is_flat() {
        let event = ServerEvent::Message(ChatMessage {
            id: 1,
            conversation_id: 2,
            user_id: 3,
            content: "hi".into(),
            created_at: 100,
        });

        assert_eq!(
            value(&event),
            json!({
                "type": "message",
                "payload": {
                    "id": 1, "conversation_id": 2, "user_id": 3,
                    "content": "hi", "created_at": 100
                }
            })
        );
    }

    #[test]
    fn test_names_match_tags() {
        let events = [
            ServerEvent::Pong {},
            ServerEvent::AuthError { message: "x".into() },
            ServerEvent::ConversationCreated {
                conversation: ConversationSummary {
                    id: 1,
                    kind: ConversationKind::Group,
                    members: vec![],
                },
            },
            ServerEvent::InviteCreated { code: "A".into(), url: "u".into() },
            ServerEvent::UserOnline { user: UserSummary::new(1, "a") },
        ];

        for event in events {
            assert_eq!(value(&event)["type"], event.name());
        }
    }
}
