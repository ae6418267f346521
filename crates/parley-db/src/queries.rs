//! Query functions for the conversation repository. Every function takes a
//! `&Connection` so multi-step pipelines can run them against one transaction
//! handle (`rusqlite::Transaction` derefs to `Connection`).

use anyhow::Result;
use rusqlite::Connection;

use crate::models::{ConversationRow, MessageRow, UserRow, ViewRow};

/// True when an INSERT failed against a UNIQUE or PRIMARY KEY constraint.
/// A failed statement does not abort a SQLite transaction, so callers can
/// compensate (re-read the winning row) and carry on.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Sort two user ids into the canonical (pair_lo, pair_hi) order.
pub fn pair_key<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

// -- Users --

pub fn insert_user(conn: &Connection, user: &UserRow) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, email, name, password, public_key, last_seen, conversations_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            user.id,
            user.email,
            user.name,
            user.password,
            user.public_key,
            user.last_seen,
            user.conversations_count,
            user.created_at,
        ],
    )?;
    Ok(())
}

pub fn user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, name, password, public_key, last_seen, conversations_count, created_at
         FROM users WHERE id = ?1",
    )?;
    stmt.query_row([id], user_from_row).optional()
}

pub fn user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, name, password, public_key, last_seen, conversations_count, created_at
         FROM users WHERE email = ?1",
    )?;
    stmt.query_row([email], user_from_row).optional()
}

pub fn search_users(conn: &Connection, name: &str, limit: u32) -> Result<Vec<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, email, name, password, public_key, last_seen, conversations_count, created_at
         FROM users WHERE name LIKE ?1 ESCAPE '\\' ORDER BY name LIMIT ?2",
    )?;
    // LIKE metacharacters in the query are literals, not wildcards.
    let pattern = format!(
        "%{}%",
        name.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    );
    let rows = stmt
        .query_map(rusqlite::params![pattern, limit], user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn touch_last_seen(conn: &Connection, id: &str, at: &str) -> Result<()> {
    conn.execute("UPDATE users SET last_seen = ?1 WHERE id = ?2", (at, id))?;
    Ok(())
}

/// Increment a user's denormalized conversation count; returns the new value.
pub fn bump_conversations_count(conn: &Connection, id: &str) -> Result<i64> {
    conn.execute(
        "UPDATE users SET conversations_count = conversations_count + 1 WHERE id = ?1",
        [id],
    )?;
    let count = conn.query_row(
        "SELECT conversations_count FROM users WHERE id = ?1",
        [id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// -- Conversations --

/// Raw rusqlite error is surfaced so the resolver can detect the
/// (pair, kind) UNIQUE violation and compensate.
pub fn insert_conversation(
    conn: &Connection,
    conversation: &ConversationRow,
) -> std::result::Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO conversations (id, kind, pair_lo, pair_hi, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            conversation.id,
            conversation.kind,
            conversation.pair_lo,
            conversation.pair_hi,
            conversation.created_at,
        ],
    )?;
    Ok(())
}

pub fn conversation_by_pair(
    conn: &Connection,
    kind: &str,
    pair_lo: &str,
    pair_hi: &str,
) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, pair_lo, pair_hi, created_at FROM conversations
         WHERE kind = ?1 AND pair_lo = ?2 AND pair_hi = ?3",
    )?;
    stmt.query_row([kind, pair_lo, pair_hi], conversation_from_row)
        .optional()
}

pub fn conversation_by_id(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, pair_lo, pair_hi, created_at FROM conversations WHERE id = ?1",
    )?;
    stmt.query_row([id], conversation_from_row).optional()
}

pub fn insert_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
        (conversation_id, user_id),
    )?;
    Ok(())
}

pub fn is_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            (conversation_id, user_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn participant_ids(conn: &Connection, conversation_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM participants WHERE conversation_id = ?1")?;
    let rows = stmt
        .query_map([conversation_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Conversation views --

pub fn insert_view(conn: &Connection, view: &ViewRow) -> Result<()> {
    conn.execute(
        "INSERT INTO conversation_views
            (user_id, conversation_id, participant_id, messages_count,
             unread_messages_count, last_message_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            view.user_id,
            view.conversation_id,
            view.participant_id,
            view.messages_count,
            view.unread_messages_count,
            view.last_message_id,
            view.updated_at,
        ],
    )?;
    Ok(())
}

pub fn view(conn: &Connection, user_id: &str, conversation_id: &str) -> Result<Option<ViewRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, conversation_id, participant_id, messages_count,
                unread_messages_count, last_message_id, updated_at
         FROM conversation_views WHERE user_id = ?1 AND conversation_id = ?2",
    )?;
    stmt.query_row([user_id, conversation_id], view_from_row)
        .optional()
}

pub fn views_of_conversation(conn: &Connection, conversation_id: &str) -> Result<Vec<ViewRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, conversation_id, participant_id, messages_count,
                unread_messages_count, last_message_id, updated_at
         FROM conversation_views WHERE conversation_id = ?1",
    )?;
    let rows = stmt
        .query_map([conversation_id], view_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn views_of_user(conn: &Connection, user_id: &str) -> Result<Vec<ViewRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, conversation_id, participant_id, messages_count,
                unread_messages_count, last_message_id, updated_at
         FROM conversation_views WHERE user_id = ?1 ORDER BY updated_at DESC",
    )?;
    let rows = stmt
        .query_map([user_id], view_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Fold a freshly appended message into one side's view: bump the total,
/// bump unread only for non-author sides, point last_message at it.
pub fn record_message_on_view(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    message_id: &str,
    at: &str,
    unread: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE conversation_views
         SET messages_count = messages_count + 1,
             unread_messages_count = unread_messages_count + ?1,
             last_message_id = ?2,
             updated_at = ?3
         WHERE user_id = ?4 AND conversation_id = ?5",
        rusqlite::params![i64::from(unread), message_id, at, user_id, conversation_id],
    )?;
    Ok(())
}

/// Deliberately unclamped: a negative result would mean a double decrement,
/// which is a data-integrity bug to surface, not to hide.
pub fn decrement_unread(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    by: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE conversation_views
         SET unread_messages_count = unread_messages_count - ?1
         WHERE user_id = ?2 AND conversation_id = ?3",
        rusqlite::params![by, user_id, conversation_id],
    )?;
    Ok(())
}

// -- Messages --

pub fn insert_message(conn: &Connection, message: &MessageRow) -> Result<()> {
    conn.execute(
        "INSERT INTO messages
            (id, conversation_id, author_id, content_type, content, read,
             read_at, edited, consumed, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            message.id,
            message.conversation_id,
            message.author_id,
            message.content_type,
            message.content,
            message.read,
            message.read_at,
            message.edited,
            message.consumed,
            message.created_at,
        ],
    )?;
    Ok(())
}

pub fn message_by_id(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, author_id, content_type, content, read,
                read_at, edited, consumed, created_at
         FROM messages WHERE id = ?1",
    )?;
    stmt.query_row([id], message_from_row).optional()
}

pub fn insert_receipt(conn: &Connection, message_id: &str, recipient_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO message_receipts (message_id, recipient_id) VALUES (?1, ?2)",
        (message_id, recipient_id),
    )?;
    Ok(())
}

pub fn has_receipt(conn: &Connection, message_id: &str, recipient_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM message_receipts WHERE message_id = ?1 AND recipient_id = ?2",
            (message_id, recipient_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn mark_read(conn: &Connection, message_id: &str, at: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages SET read = 1, read_at = ?1 WHERE id = ?2",
        (at, message_id),
    )?;
    Ok(())
}

pub fn mark_many_read(conn: &Connection, message_ids: &[String], at: &str) -> Result<()> {
    let mut stmt = conn.prepare("UPDATE messages SET read = 1, read_at = ?1 WHERE id = ?2")?;
    for id in message_ids {
        stmt.execute((at, id))?;
    }
    Ok(())
}

/// Every unread message in a conversation created at or before the anchor
/// timestamp, excluding those the reader authored, oldest first.
pub fn unread_up_to(
    conn: &Connection,
    conversation_id: &str,
    anchor_created_at: &str,
    reader_id: &str,
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, author_id, content_type, content, read,
                read_at, edited, consumed, created_at
         FROM messages
         WHERE conversation_id = ?1 AND read = 0 AND created_at <= ?2 AND author_id != ?3
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([conversation_id, anchor_created_at, reader_id], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// One page of history, newest first, with an optional `created_at` cursor.
pub fn messages_page(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, author_id, content_type, content, read,
                read_at, edited, consumed, created_at
         FROM messages
         WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2)
         ORDER BY created_at DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![conversation_id, before, limit], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Row mapping --

fn user_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password: row.get(3)?,
        public_key: row.get(4)?,
        last_seen: row.get(5)?,
        conversations_count: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn conversation_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        pair_lo: row.get(2)?,
        pair_hi: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn view_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<ViewRow, rusqlite::Error> {
    Ok(ViewRow {
        user_id: row.get(0)?,
        conversation_id: row.get(1)?,
        participant_id: row.get(2)?,
        messages_count: row.get(3)?,
        unread_messages_count: row.get(4)?,
        last_message_id: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        author_id: row.get(2)?,
        content_type: row.get(3)?,
        content: row.get(4)?,
        read: row.get(5)?,
        read_at: row.get(6)?,
        edited: row.get(7)?,
        consumed: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, now_rfc3339};

    fn test_user(id: &str, name: &str) -> UserRow {
        UserRow {
            id: id.to_string(),
            email: format!("{name}@example.com"),
            name: name.to_string(),
            password: "argon2-hash".to_string(),
            public_key: None,
            last_seen: now_rfc3339(),
            conversations_count: 0,
            created_at: now_rfc3339(),
        }
    }

    fn seed_pair(conn: &Connection) -> (UserRow, UserRow, ConversationRow) {
        let alice = test_user("a0000000-0000-4000-8000-000000000001", "alice");
        let bob = test_user("b0000000-0000-4000-8000-000000000002", "bob");
        insert_user(conn, &alice).unwrap();
        insert_user(conn, &bob).unwrap();

        let (lo, hi) = pair_key(&alice.id, &bob.id);
        let conversation = ConversationRow {
            id: "c0000000-0000-4000-8000-000000000003".to_string(),
            kind: "private".to_string(),
            pair_lo: lo.to_string(),
            pair_hi: hi.to_string(),
            created_at: now_rfc3339(),
        };
        insert_conversation(conn, &conversation).unwrap();
        (alice, bob, conversation)
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("a", "b"), pair_key("b", "a"));
    }

    #[test]
    fn search_treats_like_metacharacters_as_literals() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_user(conn, &test_user("a0000000-0000-4000-8000-000000000010", "john_doe"))?;
            insert_user(conn, &test_user("a0000000-0000-4000-8000-000000000011", "johnadoe"))?;

            // An underscore in the query matches only a literal underscore.
            let found = search_users(conn, "john_doe", 10)?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].name, "john_doe");

            // A percent sign cannot be used as a wildcard.
            assert!(search_users(conn, "john%doe", 10)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_pair_and_kind_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (_, _, conversation) = seed_pair(conn);

            let duplicate = ConversationRow {
                id: "d0000000-0000-4000-8000-000000000004".to_string(),
                ..conversation.clone()
            };
            let err = insert_conversation(conn, &duplicate).unwrap_err();
            assert!(is_unique_violation(&err));

            // Same pair, different kind is a distinct conversation.
            let secret = ConversationRow {
                id: "e0000000-0000-4000-8000-000000000005".to_string(),
                kind: "secret".to_string(),
                ..conversation
            };
            insert_conversation(conn, &secret).unwrap();
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn view_counters_follow_sends_and_reads() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (alice, bob, conversation) = seed_pair(conn);
            let now = now_rfc3339();

            insert_view(
                conn,
                &ViewRow {
                    user_id: bob.id.clone(),
                    conversation_id: conversation.id.clone(),
                    participant_id: alice.id.clone(),
                    messages_count: 0,
                    unread_messages_count: 0,
                    last_message_id: None,
                    updated_at: now.clone(),
                },
            )?;

            record_message_on_view(conn, &bob.id, &conversation.id, "m1", &now, true)?;
            record_message_on_view(conn, &bob.id, &conversation.id, "m2", &now, true)?;

            let v = view(conn, &bob.id, &conversation.id)?.unwrap();
            assert_eq!(v.messages_count, 2);
            assert_eq!(v.unread_messages_count, 2);
            assert_eq!(v.last_message_id.as_deref(), Some("m2"));

            decrement_unread(conn, &bob.id, &conversation.id, 1)?;
            let v = view(conn, &bob.id, &conversation.id)?.unwrap();
            assert_eq!(v.unread_messages_count, 1);
            assert!(v.unread_messages_count <= v.messages_count);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unread_up_to_excludes_reader_and_later_messages() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (alice, bob, conversation) = seed_pair(conn);

            for (id, author, at) in [
                ("m1", &alice.id, "2026-01-01T00:00:01.000000Z"),
                ("m2", &alice.id, "2026-01-01T00:00:02.000000Z"),
                ("m3", &bob.id, "2026-01-01T00:00:03.000000Z"),
                ("m4", &alice.id, "2026-01-01T00:00:04.000000Z"),
            ] {
                insert_message(
                    conn,
                    &MessageRow {
                        id: id.to_string(),
                        conversation_id: conversation.id.clone(),
                        author_id: author.to_string(),
                        content_type: "text/plain".to_string(),
                        content: "hello".to_string(),
                        read: false,
                        read_at: None,
                        edited: false,
                        consumed: None,
                        created_at: at.to_string(),
                    },
                )?;
            }

            // Anchor at m3: bob's own m3 is excluded, m4 is too recent.
            let batch = unread_up_to(
                conn,
                &conversation.id,
                "2026-01-01T00:00:03.000000Z",
                &bob.id,
            )?;
            let ids: Vec<&str> = batch.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["m1", "m2"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<(), anyhow::Error> = db.with_tx(|tx| {
            insert_user(tx, &test_user("f0000000-0000-4000-8000-000000000006", "carol"))?;
            anyhow::bail!("boom");
        });
        assert!(result.is_err());

        db.with_conn(|conn| {
            assert!(user_by_id(conn, "f0000000-0000-4000-8000-000000000006")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn messages_page_paginates_backwards() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (alice, _, conversation) = seed_pair(conn);
            for i in 1..=5 {
                insert_message(
                    conn,
                    &MessageRow {
                        id: format!("m{i}"),
                        conversation_id: conversation.id.clone(),
                        author_id: alice.id.clone(),
                        content_type: "text/plain".to_string(),
                        content: format!("msg {i}"),
                        read: false,
                        read_at: None,
                        edited: false,
                        consumed: None,
                        created_at: format!("2026-01-01T00:00:0{i}.000000Z"),
                    },
                )?;
            }

            let first = messages_page(conn, &conversation.id, 2, None)?;
            assert_eq!(
                first.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
                vec!["m5", "m4"]
            );

            let older = messages_page(conn, &conversation.id, 10, Some(&first[1].created_at))?;
            assert_eq!(
                older.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
                vec!["m3", "m2", "m1"]
            );
            Ok(())
        })
        .unwrap();
    }
}
