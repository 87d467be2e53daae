use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug)]
pub enum AppError {
    /// Missing/invalid bearer token
    Unauthorized(String),
    /// Missing or malformed input on a client-facing endpoint (422)
    Validation(String),
    /// Referenced entity absent
    #[allow(dead_code)]
    NotFound(String),
    /// Billing provider transport failure / timeout / 5xx
    ProviderUnavailable(String),
    /// Billing provider rejected the purchase token as invalid
    ProviderRejected(String),
    /// Internal server error (DB, serialization, transient)
    Internal(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::ProviderUnavailable(msg) => write!(f, "provider unavailable: {msg}"),
            Self::ProviderRejected(msg) => write!(f, "provider rejected: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized".to_string()),
            Self::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "validation", msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            Self::ProviderUnavailable(_) => (
                StatusCode::BAD_GATEWAY,
                "provider_unavailable",
                "Billing provider unavailable".to_string(),
            ),
            Self::ProviderRejected(_) => (
                StatusCode::BAD_REQUEST,
                "provider_rejected",
                "Billing provider rejected the purchase".to_string(),
            ),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Internal server error".to_string(),
            ),
        };
        let body = serde_json::json!({ "ok": false, "error": code, "message": message });
        (status, Json(body)).into_response()
    }
}
