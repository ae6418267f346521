//! The message pipeline: one transaction covering conversation resolution,
//! the message row, the recipient's receipt, and both view updates; then
//! best-effort fan-out after commit. A recipient never observes the delivery
//! event before the view update that explains it.

use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::error;
use uuid::Uuid;

use parley_db::{Database, models::MessageRow, now_rfc3339, queries};
use parley_gateway::Notify;
use parley_types::api::{Claims, FieldErrors, SendMessageRequest, SendMessageResponse};
use parley_types::events::GatewayEvent;
use parley_types::models::ConversationKind;

use crate::auth::{AppState, principal};
use crate::error::EngineError;
use crate::render;
use crate::resolver;

#[derive(Debug)]
struct Validated {
    to: Uuid,
    text: String,
    kind: ConversationKind,
}

/// Shape validation: field-keyed errors, no side effects, no storage access.
fn validate(req: &SendMessageRequest) -> Result<Validated, EngineError> {
    let mut errors = FieldErrors::new();

    let to = match req.to.parse::<Uuid>() {
        Ok(to) => Some(to),
        Err(_) => {
            errors.insert("to".to_string(), "Recipient id is malformed".to_string());
            None
        }
    };

    let text = req.text.trim();
    if text.is_empty() {
        errors.insert("text".to_string(), "Message text is required".to_string());
    }

    let kind = match req.kind.as_deref() {
        None => Some(ConversationKind::Private),
        Some(raw) => match ConversationKind::parse(raw) {
            Some(kind) => Some(kind),
            None => {
                errors.insert("kind".to_string(), "Unknown conversation kind".to_string());
                None
            }
        },
    };

    if !errors.is_empty() {
        return Err(EngineError::Rejected(errors));
    }
    Ok(Validated {
        to: to.unwrap(),
        text: text.to_string(),
        kind: kind.unwrap(),
    })
}

pub fn send_message(
    db: &Database,
    notifier: &dyn Notify,
    claims: &Claims,
    req: &SendMessageRequest,
) -> Result<SendMessageResponse, EngineError> {
    let input = validate(req)?;

    let (response, events) = db.with_tx(|tx| {
        let sender = principal(tx, claims)?;
        if input.to.to_string() == sender.id {
            return Err(crate::error::reject(
                "to",
                "Can't send a message to yourself",
            ));
        }
        let recipient = queries::user_by_id(tx, &input.to.to_string())?
            .ok_or_else(|| crate::error::reject("to", "Recipient doesn't exist"))?;

        let now = now_rfc3339();
        let resolved = resolver::resolve(tx, input.kind, &sender, &recipient, &now)?;
        let conversation_id = resolved.conversation.id.clone();

        let message = MessageRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            author_id: sender.id.clone(),
            content_type: "text/plain".to_string(),
            content: input.text.clone(),
            read: false,
            read_at: None,
            edited: false,
            consumed: None,
            created_at: now.clone(),
        };
        queries::insert_message(tx, &message)?;
        queries::insert_receipt(tx, &message.id, &recipient.id)?;

        queries::record_message_on_view(tx, &sender.id, &conversation_id, &message.id, &now, false)?;
        queries::record_message_on_view(tx, &recipient.id, &conversation_id, &message.id, &now, true)?;

        let sender_bundle = render::require_view_bundle(tx, &sender.id, &conversation_id)?;
        let recipient_bundle = render::require_view_bundle(tx, &recipient.id, &conversation_id)?;

        let mut events: Vec<(Uuid, GatewayEvent)> = Vec::new();
        for (user_id, conversations_count) in &resolved.new_counts {
            events.push((
                render::parse_id(user_id),
                GatewayEvent::ConversationsCountUpdated {
                    conversations_count: *conversations_count,
                },
            ));
        }
        for (user, bundle) in [(&sender, &sender_bundle), (&recipient, &recipient_bundle)] {
            let target = render::parse_id(&user.id);
            events.push((
                target,
                GatewayEvent::ConversationUpdated {
                    conversation: render::conversation_payload(bundle),
                },
            ));
            events.push((
                target,
                GatewayEvent::MessageDelivered {
                    message: render::message_payload(&message, &sender, bundle),
                },
            ));
        }

        let response = SendMessageResponse {
            message: Some(render::message_payload(&message, &sender, &sender_bundle)),
            conversation: Some(render::conversation_payload(&sender_bundle)),
            errors: FieldErrors::new(),
        };
        Ok::<_, EngineError>((response, events))
    })?;

    for (target, event) in events {
        notifier.publish(target, event);
    }
    Ok(response)
}

pub async fn send_message_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, StatusCode> {
    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();

    let result = tokio::task::spawn_blocking(move || send_message(&db, &dispatcher, &claims, &req))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            let errors = e.into_field_errors()?;
            Ok(Json(SendMessageResponse {
                message: None,
                conversation: None,
                errors,
            }))
        }
    }
}
