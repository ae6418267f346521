//! Ephemeral typing indicator. One pipeline consumed by two thin adapters:
//! the WebSocket Typing command and the REST procedure. Nothing is persisted
//! and nothing touches counters.

use anyhow::{Context, Result};
use uuid::Uuid;

use parley_db::{Database, models::UserRow, queries};
use parley_types::api::FieldErrors;
use parley_types::events::GatewayEvent;
use parley_types::models::UserPayload;

use crate::dispatcher::Notify;

#[derive(Debug, Clone, Copy)]
pub enum TypingTarget {
    User(Uuid),
    Conversation(Uuid),
}

#[derive(Debug)]
pub enum TypingOutcome {
    Sent,
    Rejected(FieldErrors),
}

/// Verify the target (recipient exists, or the sender is a participant of
/// the conversation), then publish to every other participant. Never echoed
/// back to the sender.
pub fn notify_typing(
    db: &Database,
    notifier: &dyn Notify,
    sender_id: Uuid,
    target: TypingTarget,
) -> Result<TypingOutcome> {
    db.with_conn(|conn| {
        let sender = match queries::user_by_id(conn, &sender_id.to_string())? {
            Some(user) => user,
            None => return Ok(TypingOutcome::Rejected(reject("user", "Sender doesn't exist"))),
        };
        let typist = typist_payload(&sender)?;

        match target {
            TypingTarget::User(to) => {
                if queries::user_by_id(conn, &to.to_string())?.is_none() {
                    return Ok(TypingOutcome::Rejected(reject("to", "Recipient doesn't exist")));
                }
                notifier.publish(
                    to,
                    GatewayEvent::Typing {
                        conversation: None,
                        user: typist,
                    },
                );
            }
            TypingTarget::Conversation(conversation_id) => {
                let key = conversation_id.to_string();
                if queries::conversation_by_id(conn, &key)?.is_none() {
                    return Ok(TypingOutcome::Rejected(reject(
                        "conversation",
                        "Conversation doesn't exist",
                    )));
                }
                if !queries::is_participant(conn, &key, &sender.id)? {
                    return Ok(TypingOutcome::Rejected(reject(
                        "conversation",
                        "You're not a participant of this conversation",
                    )));
                }
                for participant_id in queries::participant_ids(conn, &key)? {
                    if participant_id == sender.id {
                        continue;
                    }
                    let to: Uuid = participant_id
                        .parse()
                        .with_context(|| format!("corrupt participant id '{participant_id}'"))?;
                    notifier.publish(
                        to,
                        GatewayEvent::Typing {
                            conversation: Some(conversation_id),
                            user: typist.clone(),
                        },
                    );
                }
            }
        }

        Ok(TypingOutcome::Sent)
    })
}

fn typist_payload(user: &UserRow) -> Result<UserPayload> {
    Ok(UserPayload {
        uuid: user
            .id
            .parse()
            .with_context(|| format!("corrupt user id '{}'", user.id))?,
        name: user.name.clone(),
        public_key: user.public_key.clone(),
    })
}

fn reject(field: &str, reason: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    errors.insert(field.to_string(), reason.to_string());
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use parley_db::now_rfc3339;

    struct RecordingNotifier {
        events: Mutex<Vec<(Uuid, GatewayEvent)>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<(Uuid, GatewayEvent)> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    impl Notify for RecordingNotifier {
        fn publish(&self, user_id: Uuid, event: GatewayEvent) {
            self.events.lock().unwrap().push((user_id, event));
        }
    }

    fn seed_user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.with_conn(|conn| {
            queries::insert_user(
                conn,
                &parley_db::models::UserRow {
                    id: id.to_string(),
                    email: format!("{name}@example.com"),
                    name: name.to_string(),
                    password: "hash".to_string(),
                    public_key: Some(format!("{name}-public-key")),
                    last_seen: now_rfc3339(),
                    conversations_count: 0,
                    created_at: now_rfc3339(),
                },
            )
        })
        .unwrap();
        id
    }

    fn seed_conversation(db: &Database, a: Uuid, b: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        db.with_conn(|conn| {
            let (a, b) = (a.to_string(), b.to_string());
            let (lo, hi) = queries::pair_key(&a, &b);
            queries::insert_conversation(
                conn,
                &parley_db::models::ConversationRow {
                    id: id.to_string(),
                    kind: "private".to_string(),
                    pair_lo: lo.to_string(),
                    pair_hi: hi.to_string(),
                    created_at: now_rfc3339(),
                },
            )?;
            queries::insert_participant(conn, &id.to_string(), &a)?;
            queries::insert_participant(conn, &id.to_string(), &b)?;
            Ok(())
        })
        .unwrap();
        id
    }

    #[test]
    fn direct_typing_reaches_only_the_target() {
        let db = Database::open_in_memory().unwrap();
        let notifier = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        let outcome =
            notify_typing(&db, &notifier, alice, TypingTarget::User(bob)).unwrap();
        assert!(matches!(outcome, TypingOutcome::Sent));

        let events = notifier.take();
        assert_eq!(events.len(), 1);
        let (target, event) = &events[0];
        assert_eq!(*target, bob);
        match event {
            GatewayEvent::Typing { conversation, user } => {
                assert!(conversation.is_none());
                assert_eq!(user.uuid, alice);
                assert_eq!(user.public_key.as_deref(), Some("alice-public-key"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn conversation_typing_skips_the_sender() {
        let db = Database::open_in_memory().unwrap();
        let notifier = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let conversation = seed_conversation(&db, alice, bob);

        notify_typing(&db, &notifier, alice, TypingTarget::Conversation(conversation)).unwrap();

        let events = notifier.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, bob);
    }

    #[test]
    fn unknown_target_is_rejected_without_fanout() {
        let db = Database::open_in_memory().unwrap();
        let notifier = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");

        let outcome =
            notify_typing(&db, &notifier, alice, TypingTarget::User(Uuid::new_v4())).unwrap();
        match outcome {
            TypingOutcome::Rejected(errors) => assert!(errors.contains_key("to")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(notifier.take().is_empty());
    }

    #[test]
    fn non_participant_cannot_signal_into_a_conversation() {
        let db = Database::open_in_memory().unwrap();
        let notifier = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let mallory = seed_user(&db, "mallory");
        let conversation = seed_conversation(&db, alice, bob);

        let outcome =
            notify_typing(&db, &notifier, mallory, TypingTarget::Conversation(conversation))
                .unwrap();
        match outcome {
            TypingOutcome::Rejected(errors) => assert!(errors.contains_key("conversation")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(notifier.take().is_empty());
    }
}
