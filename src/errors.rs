use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Invalid(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

/// Failure taxonomy of a conversation turn. Every variant is converted
/// to a spoken fallback at the engine boundary; none of these ever reach
/// the caller raw.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("caller input could not be classified")]
    InputAmbiguous,

    #[error("no open slots match the request")]
    NoAvailability,

    #[error("slot was taken before the booking committed")]
    SlotConflict,

    #[error("caller request failed validation: {0}")]
    Validation(String),

    #[error("language collaborator unavailable: {0}")]
    Upstream(String),

    #[error("no active session for this call")]
    SessionExpired,

    #[error("storage failure")]
    Store(#[from] anyhow::Error),
}
