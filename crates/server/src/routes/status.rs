//! Daemon status endpoint. Unauthenticated by design so clients can probe
//! reachability before presenting credentials.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub cli_version: String,
    pub active_sessions: usize,
    pub tabs: Vec<TabInfo>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct TabInfo {
    pub id: String,
    pub attached: bool,
    pub created: DateTime<Utc>,
}

/// GET /api/status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    // Tab listing is advisory here; a multiplexer that is not up yet must
    // not break the probe.
    let tabs = state
        .tmux
        .list_ours()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tab| {
            state.tmux.session_id_of(&tab.name).map(|id| TabInfo {
                id: id.to_string(),
                attached: tab.attached,
                created: tab.created,
            })
        })
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        cli_version: state.cli_version.clone(),
        active_sessions: state.bridges.active_count(),
        tabs,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(get_status))
}
