//! HTTP surface of the daemon.
//!
//! `/api/status` is open (liveness probe); the rest of `/api` requires the
//! bearer PSK; `/terminal/:id` authenticates during the WebSocket upgrade
//! because browser clients cannot set headers there.

pub mod projects;
pub mod sessions;
pub mod status;
pub mod terminal;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;

pub fn api_routes(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .merge(sessions::router())
        .merge(projects::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .nest("/api", Router::new().merge(status::router()).merge(protected))
        .merge(terminal::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
