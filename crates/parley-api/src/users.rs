//! User lookup endpoints: own profile, recipient lookup by id, and name
//! search for starting new conversations.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::error;
use uuid::Uuid;

use parley_db::queries;
use parley_types::api::{Claims, UserSearchQuery};
use parley_types::models::{UserPayload, UserProfile};

use crate::auth::{AppState, resolve_principal};
use crate::render;

const SEARCH_LIMIT: u32 = 20;

pub async fn me_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UserProfile>, StatusCode> {
    let db = state.db.clone();
    let user = tokio::task::spawn_blocking(move || resolve_principal(&db, &claims))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| e.into_field_errors().err().unwrap_or(StatusCode::UNAUTHORIZED))?;

    Ok(Json(render::profile(&user)))
}

pub async fn get_user_handler(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<Json<UserPayload>, StatusCode> {
    let db = state.db.clone();
    let user = tokio::task::spawn_blocking(move || {
        db.with_conn(|conn| queries::user_by_id(conn, &user_id.to_string()))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("user lookup failed: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(render::user_payload(&user)))
}

pub async fn search_users_handler(
    State(state): State<AppState>,
    Query(query): Query<UserSearchQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<UserPayload>>, StatusCode> {
    let db = state.db.clone();
    let users = tokio::task::spawn_blocking(move || {
        db.with_conn(|conn| queries::search_users(conn, &query.name, SEARCH_LIMIT))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("user search failed: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // Never surface the caller themselves as a recipient candidate.
    let caller = claims.sub.to_string();
    let payloads = users
        .iter()
        .filter(|user| user.id != caller)
        .map(render::user_payload)
        .collect();

    Ok(Json(payloads))
}
