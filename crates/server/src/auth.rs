//! Pre-shared-key authentication.
//!
//! REST endpoints take `Authorization: Bearer <psk>`; WebSocket upgrades may
//! instead carry `?token=<psk>` because browser WebSocket clients cannot set
//! headers. Comparison is constant-time over equal-length buffers; a length
//! mismatch rejects without comparing any bytes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Constant-time PSK check. Unequal lengths short-circuit to false without
/// touching the byte contents.
pub fn verify_psk(candidate: &str, expected: &str) -> bool {
    let candidate = candidate.as_bytes();
    let expected = expected.as_bytes();
    if candidate.len() != expected.len() {
        return false;
    }
    candidate.ct_eq(expected).into()
}

/// Extract the bearer token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}

/// Layer for the authenticated REST surface.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(|token| verify_psk(token, &state.config.auth.psk))
        .unwrap_or(false);

    if !authorized {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::warn!(peer = %peer, path = %request.uri().path(), "Rejected unauthenticated request");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// WebSocket upgrade auth: query-string token or bearer header.
pub fn ws_authorized(
    state: &AppState,
    token: Option<&str>,
    authorization_header: Option<&str>,
) -> bool {
    if let Some(token) = token {
        if verify_psk(token, &state.config.auth.psk) {
            return true;
        }
    }
    authorization_header
        .and_then(bearer_token)
        .map(|t| verify_psk(t, &state.config.auth.psk))
        .unwrap_or(false)
}
