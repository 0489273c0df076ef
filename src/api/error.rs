use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::registry::RegistryError;

/// Error returned by REST handlers and reported in WebSocket responses.
///
/// REST bodies and WS `error` payloads share the same `code` and `message`.
#[derive(Debug)]
pub enum ApiError {
    /// No bearer token.
    AuthRequired,
    /// Token not in the table.
    AuthInvalid,
    /// The session belongs to another user.
    AccessDenied,
    SessionNotFound(String),
    InvalidRequest(String),
    /// Session ceiling reached; carries the ceiling.
    CapacityExceeded(usize),
    ShuttingDown,
    SpawnFailed(String),
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid | ApiError::AccessDenied => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::CapacityExceeded(_) | ApiError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::SpawnFailed(_) | ApiError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable code clients match on.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::AccessDenied => "access_denied",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::CapacityExceeded(_) => "capacity_exceeded",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::SpawnFailed(_) => "spawn_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Human-readable description.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Send an Authorization: Bearer header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::AccessDenied => "You do not have access to this session.".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::CapacityExceeded(max) => {
                format!("Session limit reached ({} sessions). Kill a session and retry.", max)
            }
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::SpawnFailed(detail) => format!("Failed to create session: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { max } => ApiError::CapacityExceeded(max),
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id),
            RegistryError::SpawnFailed(e) => ApiError::SpawnFailed(e.to_string()),
            RegistryError::InvalidTitle(detail) => ApiError::InvalidRequest(detail),
            RegistryError::ShuttingDown => ApiError::ShuttingDown,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
