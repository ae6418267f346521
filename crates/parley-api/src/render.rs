//! Row-to-payload rendering. Every payload is built from one participant's
//! perspective: their own view row, the counterpart as `participant`, their
//! counters. Corrupt stored values are logged and rendered as defaults rather
//! than failing the whole response.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use parley_db::models::{ConversationRow, MessageRow, UserRow, ViewRow};
use parley_db::queries;
use parley_types::models::{
    ConversationKind, ConversationPayload, MessagePayload, UserPayload, UserProfile,
};

pub fn parse_ts(value: &str) -> DateTime<Utc> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite-style "YYYY-MM-DD HH:MM:SS" without timezone.
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", value, e);
            DateTime::default()
        })
}

pub fn parse_id(value: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}': {}", value, e);
        Uuid::default()
    })
}

pub fn user_payload(user: &UserRow) -> UserPayload {
    UserPayload {
        uuid: parse_id(&user.id),
        name: user.name.clone(),
        public_key: user.public_key.clone(),
    }
}

pub fn profile(user: &UserRow) -> UserProfile {
    UserProfile {
        uuid: parse_id(&user.id),
        email: user.email.clone(),
        name: user.name.clone(),
        last_seen: parse_ts(&user.last_seen),
        conversations_count: user.conversations_count,
        public_key: user.public_key.clone(),
    }
}

/// Everything needed to render one participant's perspective on a
/// conversation: their view row, the conversation, the counterpart, and the
/// last message with its author.
pub struct ViewBundle {
    pub view: ViewRow,
    pub conversation: ConversationRow,
    pub counterpart: UserRow,
    pub last: Option<(MessageRow, UserRow)>,
}

pub fn load_view_bundle(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
) -> Result<Option<ViewBundle>> {
    let Some(view) = queries::view(conn, user_id, conversation_id)? else {
        return Ok(None);
    };
    load_bundle_for_view(conn, view).map(Some)
}

pub fn load_bundle_for_view(conn: &Connection, view: ViewRow) -> Result<ViewBundle> {
    let conversation = queries::conversation_by_id(conn, &view.conversation_id)?
        .with_context(|| format!("view points at missing conversation '{}'", view.conversation_id))?;
    let counterpart = queries::user_by_id(conn, &view.participant_id)?
        .with_context(|| format!("view points at missing user '{}'", view.participant_id))?;

    let last = match &view.last_message_id {
        Some(message_id) => {
            let message = queries::message_by_id(conn, message_id)?
                .with_context(|| format!("view points at missing message '{message_id}'"))?;
            let author = queries::user_by_id(conn, &message.author_id)?
                .with_context(|| format!("message has missing author '{}'", message.author_id))?;
            Some((message, author))
        }
        None => None,
    };

    Ok(ViewBundle {
        view,
        conversation,
        counterpart,
        last,
    })
}

/// Like `load_view_bundle` but a missing view row is an error. Used after a
/// pipeline just wrote the view inside the same transaction.
pub fn require_view_bundle(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
) -> Result<ViewBundle> {
    match load_view_bundle(conn, user_id, conversation_id)? {
        Some(bundle) => Ok(bundle),
        None => bail!("missing view for user '{user_id}' in conversation '{conversation_id}'"),
    }
}

/// Conversation payload without the embedded last message; this is the shape
/// nested inside message payloads, so the recursion bottoms out.
fn conversation_fragment(bundle: &ViewBundle) -> ConversationPayload {
    let kind = ConversationKind::parse(&bundle.conversation.kind).unwrap_or_else(|| {
        warn!(
            "Corrupt conversation kind '{}' on '{}'",
            bundle.conversation.kind, bundle.conversation.id
        );
        ConversationKind::Private
    });
    ConversationPayload {
        uuid: parse_id(&bundle.conversation.id),
        kind,
        updated_at: parse_ts(&bundle.view.updated_at),
        messages_count: bundle.view.messages_count,
        unread_messages_count: bundle.view.unread_messages_count,
        participant: user_payload(&bundle.counterpart),
        last_message: None,
    }
}

pub fn conversation_payload(bundle: &ViewBundle) -> ConversationPayload {
    let mut payload = conversation_fragment(bundle);
    if let Some((message, author)) = &bundle.last {
        payload.last_message = Some(Box::new(message_payload(message, author, bundle)));
    }
    payload
}

/// Render a message from the bundle-owner's perspective. The embedded
/// conversation fragment carries that owner's counters.
pub fn message_payload(message: &MessageRow, author: &UserRow, bundle: &ViewBundle) -> MessagePayload {
    MessagePayload {
        uuid: parse_id(&message.id),
        author: user_payload(author),
        conversation: conversation_fragment(bundle),
        read: message.read,
        read_at: message.read_at.as_deref().map(parse_ts),
        date: parse_ts(&message.created_at),
        content_type: message.content_type.clone(),
        content: message.content.clone(),
        consumed: message.consumed,
        edited: message.edited,
    }
}
