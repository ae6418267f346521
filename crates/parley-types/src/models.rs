use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation kind. `Secret` conversations carry an opaque ciphertext blob
/// as message content — encryption is a client concern, the server never sees
/// plaintext for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Secret,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Secret => "secret",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "private" => Some(Self::Private),
            "secret" => Some(Self::Secret),
            _ => None,
        }
    }
}

/// Minimal user rendering embedded in messages, views and typing events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub uuid: Uuid,
    pub name: String,
    pub public_key: Option<String>,
}

/// A user's own profile — only ever sent to that user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub uuid: Uuid,
    pub email: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub conversations_count: i64,
    pub public_key: Option<String>,
}

/// A conversation rendered from one participant's perspective: their own
/// counters, the counterpart as `participant`, and their last message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub uuid: Uuid,
    pub kind: ConversationKind,
    pub updated_at: DateTime<Utc>,
    pub messages_count: i64,
    pub unread_messages_count: i64,
    pub participant: UserPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Box<MessagePayload>>,
}

/// A message rendered from one participant's perspective. The embedded
/// conversation fragment carries that participant's own counters and never
/// nests a further `last_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub uuid: Uuid,
    pub author: UserPayload,
    pub conversation: ConversationPayload,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub date: DateTime<Utc>,
    pub content_type: String,
    pub content: String,
    pub consumed: Option<bool>,
    pub edited: bool,
}
