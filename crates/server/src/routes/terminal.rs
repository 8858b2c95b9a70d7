//! WebSocket terminal endpoint.
//!
//! `GET /terminal/:id?cols=&rows=&token=` upgrades to a WebSocket and binds
//! it to the session's multiplexer tab through the terminal bridge. Auth
//! failures and unknown sessions are reported with close codes after the
//! upgrade (4401 / 4500) since the handshake itself cannot carry a body.

use std::sync::Arc;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::header::AUTHORIZATION,
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use claude_relay_core::MultiplexerStatus;

use crate::auth;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    cols: Option<u16>,
    rows: Option<u16>,
    token: Option<String>,
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn ws_terminal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if !auth::ws_authorized(&state, query.token.as_deref(), authorization.as_deref()) {
        tracing::warn!(session_id = %id, "Rejected unauthenticated terminal upgrade");
        return ws.on_upgrade(move |socket| close_with(socket, 4401, "Unauthorized"));
    }

    if state.index.get(&id).await.is_none() {
        return ws.on_upgrade(move |socket| close_with(socket, 4500, "Unknown session"));
    }

    let cols = query
        .cols
        .filter(|c| *c > 0)
        .unwrap_or(state.config.tmux.default_cols);
    let rows = query
        .rows
        .filter(|r| *r > 0)
        .unwrap_or(state.config.tmux.default_rows);
    let tab_name = state.tmux.tab_name(&id);

    ws.on_upgrade(move |socket| async move {
        state
            .index
            .set_multiplexer_status(&id, MultiplexerStatus::Active)
            .await;
        let attached = state
            .bridges
            .attach(&id, &tab_name, socket, cols, rows)
            .await;
        // On a refused attach the previous bridge is still running, so the
        // `active` observation stands.
        if attached {
            state
                .index
                .set_multiplexer_status(&id, MultiplexerStatus::Detached)
                .await;
        }
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/terminal/{id}", get(ws_terminal))
}
