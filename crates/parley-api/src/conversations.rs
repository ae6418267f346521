//! Conversation surface: explicit secret-conversation start plus the read
//! side (conversation list and history pages).

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::error;
use uuid::Uuid;

use parley_db::{Database, now_rfc3339, queries};
use parley_gateway::Notify;
use parley_types::api::{
    Claims, FieldErrors, MessagePageQuery, StartConversationRequest, StartConversationResponse,
};
use parley_types::events::GatewayEvent;
use parley_types::models::{ConversationKind, ConversationPayload, MessagePayload};

use crate::auth::{AppState, principal};
use crate::error::{EngineError, reject};
use crate::render;
use crate::resolver;

/// Explicit conversation start, used for secret conversations so key
/// exchange can happen before the first message. Starting an existing
/// conversation returns it instead of failing.
pub fn start_conversation(
    db: &Database,
    notifier: &dyn Notify,
    claims: &Claims,
    req: &StartConversationRequest,
) -> Result<StartConversationResponse, EngineError> {
    let other_id: Uuid = req
        .user
        .parse()
        .map_err(|_| reject("user", "User id is malformed"))?;
    let kind = match req.kind.as_deref() {
        None => ConversationKind::Secret,
        Some(raw) => {
            ConversationKind::parse(raw).ok_or_else(|| reject("kind", "Unknown conversation kind"))?
        }
    };

    let (response, events) = db.with_tx(|tx| {
        let sender = principal(tx, claims)?;
        if other_id.to_string() == sender.id {
            return Err(reject("user", "Can't start a conversation with yourself"));
        }
        let other = queries::user_by_id(tx, &other_id.to_string())?
            .ok_or_else(|| reject("user", "User doesn't exist"))?;

        let now = now_rfc3339();
        let resolved = resolver::resolve(tx, kind, &sender, &other, &now)?;

        let mut events: Vec<(Uuid, GatewayEvent)> = Vec::new();
        for (user_id, conversations_count) in &resolved.new_counts {
            let target = render::parse_id(user_id);
            events.push((
                target,
                GatewayEvent::ConversationsCountUpdated {
                    conversations_count: *conversations_count,
                },
            ));
            let bundle = render::require_view_bundle(tx, user_id, &resolved.conversation.id)?;
            events.push((
                target,
                GatewayEvent::ConversationUpdated {
                    conversation: render::conversation_payload(&bundle),
                },
            ));
        }

        let bundle = render::require_view_bundle(tx, &sender.id, &resolved.conversation.id)?;
        let response = StartConversationResponse {
            conversation: Some(render::conversation_payload(&bundle)),
            errors: FieldErrors::new(),
        };
        Ok::<_, EngineError>((response, events))
    })?;

    for (target, event) in events {
        notifier.publish(target, event);
    }
    Ok(response)
}

/// Caller's conversation views, most recently updated first.
pub fn list_conversations(
    db: &Database,
    claims: &Claims,
) -> Result<Vec<ConversationPayload>, EngineError> {
    db.with_tx(|tx| {
        let user = principal(tx, claims)?;
        let views = queries::views_of_user(tx, &user.id)?;
        let mut payloads = Vec::with_capacity(views.len());
        for view in views {
            let bundle = render::load_bundle_for_view(tx, view)?;
            payloads.push(render::conversation_payload(&bundle));
        }
        Ok(payloads)
    })
}

/// One history page, newest first, cursor on `created_at`. Only participants
/// can read a conversation's history.
pub fn conversation_messages(
    db: &Database,
    claims: &Claims,
    conversation_id: Uuid,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<MessagePayload>, EngineError> {
    db.with_tx(|tx| {
        let user = principal(tx, claims)?;
        let key = conversation_id.to_string();
        if !queries::is_participant(tx, &key, &user.id)? {
            return Err(EngineError::AccessDenied);
        }

        let bundle = render::require_view_bundle(tx, &user.id, &key)?;
        let rows = queries::messages_page(tx, &key, limit.min(200), before)?;
        let mut payloads = Vec::with_capacity(rows.len());
        for message in rows {
            // Two-party: the author is either the caller or the counterpart.
            let author = if message.author_id == user.id {
                &user
            } else {
                &bundle.counterpart
            };
            payloads.push(render::message_payload(&message, author, &bundle));
        }
        Ok(payloads)
    })
}

pub async fn start_conversation_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<Json<StartConversationResponse>, StatusCode> {
    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();

    let result =
        tokio::task::spawn_blocking(move || start_conversation(&db, &dispatcher, &claims, &req))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            let errors = e.into_field_errors()?;
            Ok(Json(StartConversationResponse {
                conversation: None,
                errors,
            }))
        }
    }
}

pub async fn list_conversations_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationPayload>>, StatusCode> {
    let db = state.db.clone();

    let payloads = tokio::task::spawn_blocking(move || list_conversations(&db, &claims))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| e.into_field_errors().err().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))?;

    Ok(Json(payloads))
}

pub async fn conversation_messages_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagePageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessagePayload>>, StatusCode> {
    let db = state.db.clone();

    let payloads = tokio::task::spawn_blocking(move || {
        conversation_messages(&db, &claims, conversation_id, query.limit, query.before.as_deref())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| e.into_field_errors().err().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))?;

    Ok(Json(payloads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::send_message;
    use crate::testutil::{RecordingNotifier, claims_for, seed_user};
    use parley_types::api::SendMessageRequest;

    fn start_request(user: &str) -> StartConversationRequest {
        StartConversationRequest {
            user: user.to_string(),
            kind: None,
        }
    }

    #[test]
    fn duplicate_secret_start_returns_the_existing_conversation() {
        let db = Database::open_in_memory().unwrap();
        let notifier = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        let first =
            start_conversation(&db, &notifier, &claims_for(&alice), &start_request(&bob.id))
                .unwrap();
        let created = first.conversation.unwrap();
        assert_eq!(created.kind, ConversationKind::Secret);
        // Fresh create: a count update and a view update for each side.
        assert_eq!(notifier.take().len(), 4);

        let second =
            start_conversation(&db, &notifier, &claims_for(&bob), &start_request(&alice.id))
                .unwrap();
        assert!(second.errors.is_empty());
        assert_eq!(second.conversation.unwrap().uuid, created.uuid);
        assert!(notifier.take().is_empty());
    }

    #[test]
    fn conversation_list_is_most_recent_first() {
        let db = Database::open_in_memory().unwrap();
        let quiet = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        for to in [&bob, &carol] {
            send_message(
                &db,
                &quiet,
                &claims_for(&alice),
                &SendMessageRequest {
                    to: to.id.clone(),
                    text: format!("hi {}", to.name),
                    kind: None,
                },
            )
            .unwrap();
        }

        let conversations = list_conversations(&db, &claims_for(&alice)).unwrap();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].participant.name, "carol");
        assert_eq!(conversations[1].participant.name, "bob");
        assert!(conversations[0].last_message.is_some());
    }

    #[test]
    fn history_is_participants_only() {
        let db = Database::open_in_memory().unwrap();
        let quiet = RecordingNotifier::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let mallory = seed_user(&db, "mallory");

        let response = send_message(
            &db,
            &quiet,
            &claims_for(&alice),
            &SendMessageRequest {
                to: bob.id.clone(),
                text: "hey".to_string(),
                kind: None,
            },
        )
        .unwrap();
        let conversation_id = response.conversation.unwrap().uuid;

        let page =
            conversation_messages(&db, &claims_for(&bob), conversation_id, 50, None).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "hey");

        let err = conversation_messages(&db, &claims_for(&mallory), conversation_id, 50, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::AccessDenied));
    }
}
