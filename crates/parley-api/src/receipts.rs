//! Read-receipt pipelines. The read transition is monotone: unread -> read
//! exactly once, with exactly one unread-counter decrement. All state checks
//! happen before any write; the whole transition commits or none of it does.

use axum::{Extension, Json, extract::Path, extract::State, http::StatusCode};
use tracing::error;
use uuid::Uuid;

use parley_db::{Database, models::MessageRow, now_rfc3339, queries};
use parley_gateway::Notify;
use parley_types::api::{Claims, FieldErrors, ReadMessageResponse, ReadSinceResponse};
use parley_types::events::GatewayEvent;

use crate::auth::{AppState, principal};
use crate::error::{EngineError, reject};
use crate::render;

/// Checks shared by both pipelines: the message must exist, must not be the
/// caller's own, and the caller must hold a receipt for it.
fn readable_message(
    conn: &rusqlite::Connection,
    reader_id: &str,
    message_id: Uuid,
) -> Result<MessageRow, EngineError> {
    let message = queries::message_by_id(conn, &message_id.to_string())?
        .ok_or_else(|| reject("message", "Message doesn't exist"))?;
    if message.author_id == reader_id {
        return Err(reject("message", "Can't read your own message"));
    }
    if !queries::has_receipt(conn, &message.id, reader_id)? {
        return Err(reject("message", "Message isn't addressed to you"));
    }
    Ok(message)
}

/// Participants of the conversation with the reader first, so the caller's
/// own sessions observe the transition before anyone else's.
fn participants_reader_first(
    conn: &rusqlite::Connection,
    conversation_id: &str,
    reader_id: &str,
) -> Result<Vec<String>, EngineError> {
    let mut ids = queries::participant_ids(conn, conversation_id)?;
    ids.sort_by_key(|id| id.as_str() != reader_id);
    Ok(ids)
}

pub fn read_one(
    db: &Database,
    notifier: &dyn Notify,
    claims: &Claims,
    message_id: Uuid,
) -> Result<ReadMessageResponse, EngineError> {
    let (response, events) = db.with_tx(|tx| {
        let reader = principal(tx, claims)?;
        let mut message = readable_message(tx, &reader.id, message_id)?;
        if message.read {
            return Err(reject("message", "Message is already read"));
        }

        let now = now_rfc3339();
        queries::mark_read(tx, &message.id, &now)?;
        queries::decrement_unread(tx, &reader.id, &message.conversation_id, 1)?;
        message.read = true;
        message.read_at = Some(now);

        let author = queries::user_by_id(tx, &message.author_id)?
            .ok_or_else(|| anyhow::anyhow!("message has missing author '{}'", message.author_id))?;

        let mut events: Vec<(Uuid, GatewayEvent)> = Vec::new();
        let mut response = None;
        for participant_id in participants_reader_first(tx, &message.conversation_id, &reader.id)? {
            let bundle = render::require_view_bundle(tx, &participant_id, &message.conversation_id)?;
            let target = render::parse_id(&participant_id);
            let rendered = render::message_payload(&message, &author, &bundle);
            events.push((
                target,
                GatewayEvent::ConversationUpdated {
                    conversation: render::conversation_payload(&bundle),
                },
            ));
            events.push((
                target,
                GatewayEvent::MessageRead {
                    message: rendered.clone(),
                },
            ));
            if participant_id == reader.id {
                response = Some(ReadMessageResponse {
                    message: Some(rendered),
                    conversation: Some(render::conversation_payload(&bundle)),
                    errors: FieldErrors::new(),
                });
            }
        }

        let response = response
            .ok_or_else(|| anyhow::anyhow!("reader holds a receipt but is not a participant"))?;
        Ok::<_, EngineError>((response, events))
    })?;

    for (target, event) in events {
        notifier.publish(target, event);
    }
    Ok(response)
}

/// Mark every unread counterpart message up to (and including) the anchor as
/// read in one batch. An empty batch is a successful no-op: no writes, no
/// fan-out.
pub fn read_since(
    db: &Database,
    notifier: &dyn Notify,
    claims: &Claims,
    anchor_id: Uuid,
) -> Result<ReadSinceResponse, EngineError> {
    let (response, events) = db.with_tx(|tx| {
        let reader = principal(tx, claims)?;
        let anchor = readable_message(tx, &reader.id, anchor_id)?;

        let mut batch =
            queries::unread_up_to(tx, &anchor.conversation_id, &anchor.created_at, &reader.id)?;
        if batch.is_empty() {
            let bundle = render::require_view_bundle(tx, &reader.id, &anchor.conversation_id)?;
            let response = ReadSinceResponse {
                messages: Vec::new(),
                conversation: Some(render::conversation_payload(&bundle)),
                errors: FieldErrors::new(),
            };
            return Ok::<_, EngineError>((response, Vec::new()));
        }

        let now = now_rfc3339();
        let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        queries::mark_many_read(tx, &ids, &now)?;
        queries::decrement_unread(tx, &reader.id, &anchor.conversation_id, batch.len() as i64)?;
        for message in &mut batch {
            message.read = true;
            message.read_at = Some(now.clone());
        }

        let mut events: Vec<(Uuid, GatewayEvent)> = Vec::new();
        let mut response = None;
        for participant_id in participants_reader_first(tx, &anchor.conversation_id, &reader.id)? {
            let bundle = render::require_view_bundle(tx, &participant_id, &anchor.conversation_id)?;
            let target = render::parse_id(&participant_id);

            let mut rendered = Vec::with_capacity(batch.len());
            for message in &batch {
                let author = queries::user_by_id(tx, &message.author_id)?.ok_or_else(|| {
                    anyhow::anyhow!("message has missing author '{}'", message.author_id)
                })?;
                rendered.push(render::message_payload(message, &author, &bundle));
            }

            events.push((
                target,
                GatewayEvent::ConversationUpdated {
                    conversation: render::conversation_payload(&bundle),
                },
            ));
            events.push((
                target,
                GatewayEvent::MessagesRead {
                    messages: rendered.clone(),
                },
            ));
            if participant_id == reader.id {
                response = Some(ReadSinceResponse {
                    messages: rendered,
                    conversation: Some(render::conversation_payload(&bundle)),
                    errors: FieldErrors::new(),
                });
            }
        }

        let response = response
            .ok_or_else(|| anyhow::anyhow!("reader holds a receipt but is not a participant"))?;
        Ok::<_, EngineError>((response, events))
    })?;

    for (target, event) in events {
        notifier.publish(target, event);
    }
    Ok(response)
}

pub async fn read_message_handler(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ReadMessageResponse>, StatusCode> {
    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();

    let result =
        tokio::task::spawn_blocking(move || read_one(&db, &dispatcher, &claims, message_id))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            let errors = e.into_field_errors()?;
            Ok(Json(ReadMessageResponse {
                message: None,
                conversation: None,
                errors,
            }))
        }
    }
}

pub async fn read_since_handler(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ReadSinceResponse>, StatusCode> {
    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();

    let result =
        tokio::task::spawn_blocking(move || read_since(&db, &dispatcher, &claims, message_id))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            let errors = e.into_field_errors()?;
            Ok(Json(ReadSinceResponse {
                messages: Vec::new(),
                conversation: None,
                errors,
            }))
        }
    }
}
