//! Domain types shared by the store, the router and the wire events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User identifier.
pub type UserId = i64;

/// Conversation identifier.
pub type ConversationId = i64;

/// Message identifier.
pub type MessageId = i64;

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// Current unix time in seconds.
#[must_use]
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub nickname: String,
    /// Opaque bearer token used by `auth`.
    pub token: String,
}

impl User {
    /// Public view of the user.
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            nickname: self.nickname.clone(),
        }
    }
}

/// Public view of a user, as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub nickname: String,
}

impl UserSummary {
    #[must_use]
    pub fn new(id: UserId, nickname: impl Into<String>) -> Self {
        Self {
            id,
            nickname: nickname.into(),
        }
    }
}

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// The single conversation every authenticated user can access.
    Lobby,
    /// Two-member direct conversation.
    Dm,
    /// Conversation with three or more members.
    Group,
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationKind::Lobby => "lobby",
            ConversationKind::Dm => "dm",
            ConversationKind::Group => "group",
        };
        f.write_str(name)
    }
}

/// A conversation as seen by one user.
///
/// `members` lists the other members; it is empty for the lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub members: Vec<UserSummary>,
}

/// A stored chat message. Messages are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_summary_serialization() {
        let summary = ConversationSummary {
            id: 7,
            kind: ConversationKind::Dm,
            members: vec![UserSummary::new(2, "bob")],
        };

        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            json!({"id": 7, "type": "dm", "members": [{"id": 2, "nickname": "bob"}]})
        );
    }

    #[test]
    fn test_user_summary_hides_token() {
        let user = User {
            id: 1,
            nickname: "alice".into(),
            token: "secret".into(),
        };
        let value = serde_json::to_value(user.summary()).unwrap();
        assert_eq!(value, json!({"id": 1, "nickname": "alice"}));
    }
}
