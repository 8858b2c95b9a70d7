//! API error taxonomy and the structured error envelope.
//!
//! Every non-2xx response body is `{"error": CODE, "message": ..., "action":
//! ...}`; clients render `message` and `action` verbatim. Raw subprocess exit
//! codes and filesystem errno values never reach this layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
    pub action: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} already has an active terminal connection")]
    SessionAttached(String),

    #[error("session {0} is in use by another process on this host")]
    SessionConflict(String),

    #[error("session cap of {0} reached")]
    MaxSessions(usize),

    #[error("attach rate limit hit for session {0}")]
    RateLimited(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidSessionId(_) => "INVALID_SESSION_ID",
            Self::NotFound(_) => "NOT_FOUND",
            Self::SessionAttached(_) => "SESSION_ATTACHED",
            Self::SessionConflict(_) => "SESSION_CONFLICT",
            Self::MaxSessions(_) => "MAX_SESSIONS",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionAttached(_) | Self::SessionConflict(_) | Self::MaxSessions(_) => {
                StatusCode::CONFLICT
            }
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message_and_action(&self) -> (String, String) {
        match self {
            Self::Unauthorized => (
                "Missing or invalid credentials".to_string(),
                "Check the pre-shared key in your client settings".to_string(),
            ),
            Self::InvalidSessionId(id) => (
                format!("'{id}' is not a valid session id"),
                "Session ids are lowercase UUIDs".to_string(),
            ),
            Self::NotFound(id) => (
                format!("No session with id '{id}'"),
                "Refresh the session list".to_string(),
            ),
            Self::SessionAttached(_) => (
                "Session already has an active terminal connection".to_string(),
                "Disconnect the other client first".to_string(),
            ),
            Self::SessionConflict(_) => (
                "Session is already open in a terminal on the host".to_string(),
                "Close the local CLI using this session, then retry".to_string(),
            ),
            Self::MaxSessions(limit) => (
                format!("Maximum of {limit} concurrent sessions reached"),
                "Close an existing session tab before opening another".to_string(),
            ),
            Self::RateLimited(_) => (
                "Attach requested too soon after the previous attempt".to_string(),
                "Wait a few seconds and retry".to_string(),
            ),
            Self::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    "Internal server error".to_string(),
                    "Check the daemon log for details".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (message, action) = self.message_and_action();
        let body = ErrorEnvelope {
            error: self.code().to_string(),
            message,
            action,
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
