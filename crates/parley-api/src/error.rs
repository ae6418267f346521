use axum::http::StatusCode;
use thiserror::Error;
use tracing::error;

use parley_types::api::FieldErrors;

/// Pipeline error taxonomy. Business rejections are data (field-keyed map in
/// a 200 envelope), credential failures are one opaque 401, and storage
/// failures become a generic 500 with details only in the logs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rejected")]
    Rejected(FieldErrors),

    #[error("access denied")]
    AccessDenied,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Split a pipeline error for the REST layer: business rejections yield
    /// the field errors for the response envelope, everything else becomes an
    /// HTTP status.
    pub fn into_field_errors(self) -> Result<FieldErrors, StatusCode> {
        match self {
            Self::Rejected(errors) => Ok(errors),
            Self::AccessDenied => Err(StatusCode::UNAUTHORIZED),
            Self::Storage(e) => {
                error!("storage failure: {:#}", e);
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Single-field business rejection.
pub fn reject(field: &str, reason: &str) -> EngineError {
    let mut errors = FieldErrors::new();
    errors.insert(field.to_string(), reason.to_string());
    EngineError::Rejected(errors)
}
