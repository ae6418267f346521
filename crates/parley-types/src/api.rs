use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationPayload, MessagePayload, UserProfile};

/// Field-keyed business errors, rendered into the response envelope.
/// An empty map means the operation succeeded.
pub type FieldErrors = BTreeMap<String, String>;

// -- JWT Claims --

/// Canonical claims definition shared by parley-api (REST middleware) and
/// parley-server (WebSocket upgrade). `fpr` is the sha256 fingerprint of the
/// stored password hash: changing the password invalidates old tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub fpr: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    pub public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: Option<UserProfile>,
    pub token: Option<String>,
    pub errors: FieldErrors,
}

// -- Messenger procedures --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub to: String,
    pub text: String,
    /// "private" (default) or "secret".
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: Option<MessagePayload>,
    pub conversation: Option<ConversationPayload>,
    pub errors: FieldErrors,
}

#[derive(Debug, Serialize)]
pub struct ReadMessageResponse {
    pub message: Option<MessagePayload>,
    pub conversation: Option<ConversationPayload>,
    pub errors: FieldErrors,
}

#[derive(Debug, Serialize)]
pub struct ReadSinceResponse {
    pub messages: Vec<MessagePayload>,
    pub conversation: Option<ConversationPayload>,
    pub errors: FieldErrors,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub user: String,
    /// Defaults to "secret" — private conversations come into existence with
    /// their first message instead.
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartConversationResponse {
    pub conversation: Option<ConversationPayload>,
    pub errors: FieldErrors,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingRequest {
    pub to: Option<String>,
    pub conversation: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TypingResponse {
    pub errors: FieldErrors,
}

// -- History --

#[derive(Debug, Deserialize)]
pub struct MessagePageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` of the oldest message
    /// from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct UserSearchQuery {
    pub name: String,
}
