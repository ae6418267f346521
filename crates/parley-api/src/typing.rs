//! REST adapter over the gateway typing pipeline, for clients that hold a
//! token but no open socket.

use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::error;
use uuid::Uuid;

use parley_gateway::typing::{TypingOutcome, TypingTarget, notify_typing};
use parley_types::api::{Claims, FieldErrors, TypingRequest, TypingResponse};

use crate::auth::AppState;
use crate::auth::resolve_principal;

fn parse_target(req: &TypingRequest) -> Result<TypingTarget, FieldErrors> {
    let mut errors = FieldErrors::new();
    match (req.to.as_deref(), req.conversation.as_deref()) {
        (Some(to), None) => match to.parse::<Uuid>() {
            Ok(to) => return Ok(TypingTarget::User(to)),
            Err(_) => {
                errors.insert("to".to_string(), "Recipient id is malformed".to_string());
            }
        },
        (None, Some(conversation)) => match conversation.parse::<Uuid>() {
            Ok(conversation) => return Ok(TypingTarget::Conversation(conversation)),
            Err(_) => {
                errors.insert(
                    "conversation".to_string(),
                    "Conversation id is malformed".to_string(),
                );
            }
        },
        _ => {
            errors.insert(
                "target".to_string(),
                "Exactly one of 'to' or 'conversation' is required".to_string(),
            );
        }
    }
    Err(errors)
}

pub async fn typing_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TypingRequest>,
) -> Result<Json<TypingResponse>, StatusCode> {
    let target = match parse_target(&req) {
        Ok(target) => target,
        Err(errors) => return Ok(Json(TypingResponse { errors })),
    };

    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let sender = resolve_principal(&db, &claims)?;
        notify_typing(&db, &dispatcher, claims.sub, target)
            .map_err(crate::error::EngineError::from)
            .map(|outcome| (sender, outcome))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    match outcome {
        Ok((_, TypingOutcome::Sent)) => Ok(Json(TypingResponse {
            errors: FieldErrors::new(),
        })),
        Ok((_, TypingOutcome::Rejected(errors))) => Ok(Json(TypingResponse { errors })),
        Err(e) => {
            let errors = e.into_field_errors()?;
            Ok(Json(TypingResponse { errors }))
        }
    }
}
