/// Database row types — these map directly to SQLite rows.
/// Distinct from the parley-types payload models to keep the DB layer
/// independent of wire rendering.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: String,
    pub password: String,
    pub public_key: Option<String>,
    pub last_seen: String,
    pub conversations_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub pair_lo: String,
    pub pair_hi: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ViewRow {
    pub user_id: String,
    pub conversation_id: String,
    pub participant_id: String,
    pub messages_count: i64,
    pub unread_messages_count: i64,
    pub last_message_id: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub content_type: String,
    pub content: String,
    pub read: bool,
    pub read_at: Option<String>,
    pub edited: bool,
    pub consumed: Option<bool>,
    pub created_at: String,
}
