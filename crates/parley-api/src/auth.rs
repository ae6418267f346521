use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use sha2::{Digest, Sha256};
use tracing::error;
use uuid::Uuid;

use parley_db::{Database, now_rfc3339, queries};
use parley_gateway::Dispatcher;
use parley_types::api::{AuthResponse, Claims, FieldErrors, LoginRequest, RegisterRequest};

use crate::error::EngineError;
use crate::render;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

/// Fingerprint of the stored password hash, embedded in every token. A
/// password change produces a new hash, a new fingerprint, and therefore
/// invalidates all outstanding tokens.
pub fn fingerprint(password_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password_hash.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn create_token(secret: &str, user_id: Uuid, password_hash: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        fpr: fingerprint(password_hash),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, EngineError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| EngineError::AccessDenied)
}

/// Load the user behind verified claims and re-check the password-hash
/// fingerprint. Every failure mode collapses into the same opaque denial.
/// Takes a connection so pipelines can run it inside their own transaction.
pub fn principal(
    conn: &rusqlite::Connection,
    claims: &Claims,
) -> Result<parley_db::models::UserRow, EngineError> {
    let user =
        queries::user_by_id(conn, &claims.sub.to_string())?.ok_or(EngineError::AccessDenied)?;
    if fingerprint(&user.password) != claims.fpr {
        return Err(EngineError::AccessDenied);
    }
    Ok(user)
}

/// Standalone principal resolution for callers outside a transaction (the
/// WebSocket upgrade).
pub fn resolve_principal(
    db: &Database,
    claims: &Claims,
) -> Result<parley_db::models::UserRow, EngineError> {
    db.with_conn(|conn| Ok(principal(conn, claims)))?
}

fn validate_register(req: &RegisterRequest) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if !req.email.contains('@') || req.email.len() > 254 {
        errors.insert("email".to_string(), "Valid email is required".to_string());
    }
    if req.name.trim().len() < 3 || req.name.len() > 64 {
        errors.insert("name".to_string(), "Name must be 3-64 characters".to_string());
    }
    if req.password.len() < 8 {
        errors.insert(
            "password".to_string(),
            "Password must be at least 8 characters".to_string(),
        );
    }
    errors
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let errors = validate_register(&req);
    if !errors.is_empty() {
        return Ok(Json(AuthResponse {
            user: None,
            token: None,
            errors,
        }));
    }

    let db = state.db.clone();
    let secret = state.jwt_secret.clone();
    let response = tokio::task::spawn_blocking(move || {
        if db
            .with_conn(|conn| queries::user_by_email(conn, &req.email))?
            .is_some()
        {
            let mut errors = FieldErrors::new();
            errors.insert("email".to_string(), "Email is already registered".to_string());
            return Ok(AuthResponse {
                user: None,
                token: None,
                errors,
            });
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
            .to_string();

        let user = parley_db::models::UserRow {
            id: Uuid::new_v4().to_string(),
            email: req.email,
            name: req.name.trim().to_string(),
            password: password_hash,
            public_key: req.public_key,
            last_seen: now_rfc3339(),
            conversations_count: 0,
            created_at: now_rfc3339(),
        };
        db.with_conn(|conn| queries::insert_user(conn, &user))?;

        let token = create_token(&secret, render::parse_id(&user.id), &user.password)?;
        Ok::<_, anyhow::Error>(AuthResponse {
            user: Some(render::profile(&user)),
            token: Some(token),
            errors: FieldErrors::new(),
        })
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("registration failed: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(response))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let secret = state.jwt_secret.clone();

    let response = tokio::task::spawn_blocking(move || {
        let user = db
            .with_conn(|conn| queries::user_by_email(conn, &req.email))
            .map_err(|e| {
                error!("login lookup failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let parsed_hash =
            PasswordHash::new(&user.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        let token = create_token(&secret, render::parse_id(&user.id), &user.password)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        Ok::<_, StatusCode>(AuthResponse {
            user: Some(render::profile(&user)),
            token: Some(token),
            errors: FieldErrors::new(),
        })
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    Ok(Json(response))
}
