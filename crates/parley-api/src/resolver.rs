//! Idempotent two-party conversation resolution. The UNIQUE(pair_lo,
//! pair_hi, kind) constraint is the source of truth for at-most-one
//! conversation per unordered pair and kind; a losing concurrent creator
//! compensates by re-reading the winner instead of failing.

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use parley_db::models::{ConversationRow, UserRow, ViewRow};
use parley_db::queries;
use parley_types::models::ConversationKind;

pub struct Resolved {
    pub conversation: ConversationRow,
    /// True when this call created the conversation row.
    pub fresh: bool,
    /// (user_id, new conversations_count) for each view created by this call.
    pub new_counts: Vec<(String, i64)>,
}

/// Find or create the conversation between `sender` and `recipient` of the
/// given kind, and make sure both participants have a view row. Runs against
/// the caller's transaction handle.
pub fn resolve(
    conn: &Connection,
    kind: ConversationKind,
    sender: &UserRow,
    recipient: &UserRow,
    now: &str,
) -> Result<Resolved> {
    let (lo, hi) = queries::pair_key(&sender.id, &recipient.id);

    let (conversation, fresh) = match queries::conversation_by_pair(conn, kind.as_str(), lo, hi)? {
        Some(existing) => (existing, false),
        None => {
            let candidate = ConversationRow {
                id: Uuid::new_v4().to_string(),
                kind: kind.as_str().to_string(),
                pair_lo: lo.to_string(),
                pair_hi: hi.to_string(),
                created_at: now.to_string(),
            };
            create_or_adopt(conn, candidate, sender, recipient)?
        }
    };

    // A missing view is recreated zeroed; the user's denormalized
    // conversation count moves with it.
    let mut new_counts = Vec::new();
    for (user, counterpart) in [(sender, recipient), (recipient, sender)] {
        if queries::view(conn, &user.id, &conversation.id)?.is_none() {
            queries::insert_view(
                conn,
                &ViewRow {
                    user_id: user.id.clone(),
                    conversation_id: conversation.id.clone(),
                    participant_id: counterpart.id.clone(),
                    messages_count: 0,
                    unread_messages_count: 0,
                    last_message_id: None,
                    updated_at: now.to_string(),
                },
            )?;
            let count = queries::bump_conversations_count(conn, &user.id)?;
            new_counts.push((user.id.clone(), count));
        }
    }

    Ok(Resolved {
        conversation,
        fresh,
        new_counts,
    })
}

/// Insert the candidate conversation, or adopt the winner of a concurrent
/// creation race. A failed statement doesn't abort a SQLite transaction, so
/// the losing side can re-read the winning row and carry on.
fn create_or_adopt(
    conn: &Connection,
    candidate: ConversationRow,
    sender: &UserRow,
    recipient: &UserRow,
) -> Result<(ConversationRow, bool)> {
    match queries::insert_conversation(conn, &candidate) {
        Ok(()) => {
            queries::insert_participant(conn, &candidate.id, &sender.id)?;
            queries::insert_participant(conn, &candidate.id, &recipient.id)?;
            Ok((candidate, true))
        }
        Err(e) if queries::is_unique_violation(&e) => {
            debug!(
                "conversation creation lost a race for pair ({}, {})",
                candidate.pair_lo, candidate.pair_hi
            );
            let winner = queries::conversation_by_pair(
                conn,
                &candidate.kind,
                &candidate.pair_lo,
                &candidate.pair_hi,
            )?
            .context("unique violation but no winning conversation row")?;
            Ok((winner, false))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_db::{Database, now_rfc3339};

    fn seed_user(conn: &Connection, name: &str) -> UserRow {
        let user = UserRow {
            id: Uuid::new_v4().to_string(),
            email: format!("{name}@example.com"),
            name: name.to_string(),
            password: "hash".to_string(),
            public_key: None,
            last_seen: now_rfc3339(),
            conversations_count: 0,
            created_at: now_rfc3339(),
        };
        queries::insert_user(conn, &user).unwrap();
        user
    }

    #[test]
    fn repeated_resolution_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = seed_user(conn, "alice");
            let bob = seed_user(conn, "bob");
            let now = now_rfc3339();

            let first = resolve(conn, ConversationKind::Private, &alice, &bob, &now)?;
            assert!(first.fresh);
            assert_eq!(first.new_counts.len(), 2);

            // Same pair in the other direction resolves to the same row and
            // creates nothing.
            let second = resolve(conn, ConversationKind::Private, &bob, &alice, &now)?;
            assert!(!second.fresh);
            assert!(second.new_counts.is_empty());
            assert_eq!(second.conversation.id, first.conversation.id);

            let alice_after = queries::user_by_id(conn, &alice.id)?.unwrap();
            assert_eq!(alice_after.conversations_count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn kinds_resolve_to_distinct_conversations() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = seed_user(conn, "alice");
            let bob = seed_user(conn, "bob");
            let now = now_rfc3339();

            let private = resolve(conn, ConversationKind::Private, &alice, &bob, &now)?;
            let secret = resolve(conn, ConversationKind::Secret, &alice, &bob, &now)?;
            assert_ne!(private.conversation.id, secret.conversation.id);

            let alice_after = queries::user_by_id(conn, &alice.id)?.unwrap();
            assert_eq!(alice_after.conversations_count, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn losing_a_creation_race_adopts_the_winner() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = seed_user(conn, "alice");
            let bob = seed_user(conn, "bob");
            let now = now_rfc3339();

            let (lo, hi) = queries::pair_key(&alice.id, &bob.id);
            let winner = ConversationRow {
                id: Uuid::new_v4().to_string(),
                kind: "private".to_string(),
                pair_lo: lo.to_string(),
                pair_hi: hi.to_string(),
                created_at: now.clone(),
            };
            queries::insert_conversation(conn, &winner).unwrap();
            queries::insert_participant(conn, &winner.id, &alice.id)?;
            queries::insert_participant(conn, &winner.id, &bob.id)?;

            // A creator whose existence check ran before the winner landed
            // collides on insert and must adopt the winning row.
            let candidate = ConversationRow {
                id: Uuid::new_v4().to_string(),
                ..winner.clone()
            };
            let (adopted, fresh) = create_or_adopt(conn, candidate, &alice, &bob)?;
            assert!(!fresh);
            assert_eq!(adopted.id, winner.id);

            // Full resolution afterwards settles on the winner and only
            // backfills the views.
            let resolved = resolve(conn, ConversationKind::Private, &alice, &bob, &now)?;
            assert!(!resolved.fresh);
            assert_eq!(resolved.conversation.id, winner.id);
            assert_eq!(resolved.new_counts.len(), 2);

            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?;
            assert_eq!(total, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn missing_view_is_recreated_zeroed() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = seed_user(conn, "alice");
            let bob = seed_user(conn, "bob");
            let now = now_rfc3339();

            let first = resolve(conn, ConversationKind::Private, &alice, &bob, &now)?;
            conn.execute(
                "DELETE FROM conversation_views WHERE user_id = ?1",
                [&bob.id],
            )?;

            let repaired = resolve(conn, ConversationKind::Private, &alice, &bob, &now)?;
            assert!(!repaired.fresh);
            assert_eq!(repaired.new_counts.len(), 1);
            assert_eq!(repaired.new_counts[0].0, bob.id);

            let view = queries::view(conn, &bob.id, &first.conversation.id)?.unwrap();
            assert_eq!(view.messages_count, 0);
            assert_eq!(view.unread_messages_count, 0);
            Ok(())
        })
        .unwrap();
    }
}
