use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or incomplete request.
    InvalidRequest(String),
    /// 403 - WebSocket upgrade from a disallowed browser origin.
    OriginNotAllowed,
    /// 502 - The remote host could not be reached or rejected the login.
    SshConnectionFailed(String),
    /// 503 - Too many concurrent WebSocket connections.
    TooManyConnections,
    /// 500 - Connected, but the command could not be run to completion.
    CommandFailed(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::SshConnectionFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::CommandFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::SshConnectionFailed(_) => "ssh_connection_failed",
            ApiError::TooManyConnections => "too_many_connections",
            ApiError::CommandFailed(_) => "command_failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::OriginNotAllowed => "Origin not allowed.".to_string(),
            ApiError::SshConnectionFailed(detail) => format!("SSH connection failed: {}.", detail),
            ApiError::TooManyConnections => {
                "Too many open connections. Try again shortly.".to_string()
            }
            ApiError::CommandFailed(detail) => format!("Command execution failed: {}.", detail),
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
