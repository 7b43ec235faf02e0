use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Core error taxonomy for the Research Session Lifecycle Engine.
///
/// Variants map 1:1 onto the error taxonomy in the design: Create is fatal
/// to StartSession, Extend/Delete are logged and swallowed by their callers,
/// InternalInvariantViolation is always a bug and is logged with context.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("insufficient credit for tier {tier}")]
    InsufficientCredit { tier: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("cache create failed: {0}")]
    CacheCreateFailed(String),

    #[error("cache extend failed: {0}")]
    CacheExtendFailed(String),

    #[error("cache delete failed: {0}")]
    CacheDeleteFailed(String),

    #[error("upstream timeout during {0}")]
    UpstreamTimeout(String),

    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl AppError {
    /// Human-readable text suitable for a `{type:error, content:...}` frame.
    pub fn user_message(&self) -> String {
        match self {
            AppError::BadInput(m) => format!("bad request: {m}"),
            AppError::Unauthorized => "unauthorized".to_string(),
            AppError::InsufficientCredit { tier } => {
                format!("insufficient credit on tier '{tier}'")
            }
            AppError::SessionNotFound(id) => format!("session '{id}' not found"),
            AppError::CacheCreateFailed(_) => "could not start research session".to_string(),
            AppError::CacheExtendFailed(_) => "could not extend session".to_string(),
            AppError::CacheDeleteFailed(_) => "could not clean up session".to_string(),
            AppError::UpstreamTimeout(op) => format!("{op} timed out"),
            AppError::InternalInvariantViolation(_) => "internal error".to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::CacheCreateFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::CacheExtendFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::CacheDeleteFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::InternalInvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::InternalInvariantViolation(_)) {
            tracing::error!(error = %self, "internal invariant violation");
        }
        let body = Json(json!({ "error": self.user_message() }));
        (self.status_code(), body).into_response()
    }
}

/// Boundary conversion for collaborators that return `anyhow::Error`
/// (db, reqwest, redis). Never used for the typed Create/Extend/Delete
/// variants, which are constructed explicitly at the call site so the
/// right taxonomy member is chosen.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::InternalInvariantViolation(e.to_string())
    }
}
