//! Session listing and attach endpoints.
//!
//! - `GET /api/sessions` — all known sessions, enriched with live tab state
//! - `GET /api/sessions/:id` — one session; the id must be a lowercase UUID
//! - `POST /api/sessions/:id/attach` — prepare a tab, hand back the ws URL
//!
//! The attach route deliberately skips the UUID check: the original surface
//! accepted any id string there and failed with 404 or a conflict code, and
//! tightening it would change observable error codes.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::Serialize;

use claude_relay_core::{MessageRole, MultiplexerStatus, SessionMetadata};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::tmux::AttachError;

/// Minimum spacing between attach attempts per session.
const ATTACH_COOLDOWN: Duration = Duration::from_secs(5);

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("valid uuid regex")
    })
}

#[derive(Debug, Serialize)]
pub struct ApiSession {
    pub id: String,
    pub project_path: String,
    pub project_name: String,
    pub project_hash: String,
    pub last_message_preview: String,
    pub last_message_role: MessageRole,
    pub timestamp: DateTime<Utc>,
    pub cli_version: String,
    pub multiplexer_status: MultiplexerStatus,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: ApiSession,
    pub has_active_connection: bool,
}

#[derive(Debug, Serialize)]
pub struct AttachResponse {
    pub ws_url: String,
    pub tab_name: String,
    pub existed: bool,
}

/// Human-facing name for a project: the last component of its path, or the
/// opaque hash when no path was recovered.
fn project_name(meta: &SessionMetadata) -> String {
    let path = meta.project_path.trim_end_matches('/');
    path.rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or(&meta.project_hash)
        .to_string()
}

fn to_api(meta: SessionMetadata, status: MultiplexerStatus) -> ApiSession {
    ApiSession {
        project_name: project_name(&meta),
        id: meta.id,
        project_path: meta.project_path,
        project_hash: meta.project_hash,
        last_message_preview: meta.last_message_preview,
        last_message_role: meta.last_message_role,
        timestamp: meta.timestamp,
        cli_version: meta.cli_version,
        multiplexer_status: status,
    }
}

/// Live `{id -> status}` from a fresh tab query, pushed back into the index
/// so its advisory field tracks reality. Query failures degrade to "no tabs".
async fn live_statuses(state: &AppState) -> HashMap<String, MultiplexerStatus> {
    let tabs = state.tmux.list_ours().await.unwrap_or_default();
    let mut statuses = HashMap::new();
    for tab in tabs {
        if let Some(id) = state.tmux.session_id_of(&tab.name) {
            let status = if tab.attached {
                MultiplexerStatus::Active
            } else {
                MultiplexerStatus::Detached
            };
            statuses.insert(id.to_string(), status);
        }
    }
    for meta in state.index.list().await {
        let status = statuses
            .get(&meta.id)
            .copied()
            .unwrap_or(MultiplexerStatus::None);
        state.index.set_multiplexer_status(&meta.id, status).await;
    }
    statuses
}

/// GET /api/sessions
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<ApiSession>> {
    let statuses = live_statuses(&state).await;
    let sessions = state
        .index
        .list()
        .await
        .into_iter()
        .map(|meta| {
            let status = statuses
                .get(&meta.id)
                .copied()
                .unwrap_or(MultiplexerStatus::None);
            to_api(meta, status)
        })
        .collect();
    Json(sessions)
}

/// GET /api/sessions/:id
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionDetail>> {
    if !uuid_re().is_match(&id) {
        return Err(ApiError::InvalidSessionId(id));
    }
    let meta = state
        .index
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    let statuses = live_statuses(&state).await;
    let status = statuses
        .get(&id)
        .copied()
        .unwrap_or(MultiplexerStatus::None);
    Ok(Json(SessionDetail {
        has_active_connection: state.bridges.has_active(&id),
        session: to_api(meta, status),
    }))
}

/// POST /api/sessions/:id/attach
async fn attach_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AttachResponse>> {
    if state.index.get(&id).await.is_none() {
        return Err(ApiError::NotFound(id));
    }

    // Rate limit above the manager's per-session lock; attempts count, not
    // just successes.
    {
        let mut attempts = state.attach_attempts.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = attempts.get(&id) {
            if now.duration_since(*last) < ATTACH_COOLDOWN {
                return Err(ApiError::RateLimited(id));
            }
        }
        attempts.insert(id.clone(), now);
    }

    let (tab_name, existed) = state.tmux.attach(&id).await.map_err(|e| match e {
        AttachError::SessionAttached => ApiError::SessionAttached(id.clone()),
        AttachError::SessionConflict => ApiError::SessionConflict(id.clone()),
        AttachError::MaxSessions(limit) => ApiError::MaxSessions(limit),
        AttachError::Command(msg) => ApiError::Internal(msg),
    })?;

    if !existed {
        state
            .index
            .set_multiplexer_status(&id, MultiplexerStatus::Detached)
            .await;
    }

    Ok(Json(AttachResponse {
        ws_url: format!("/terminal/{id}"),
        tab_name,
        existed,
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/attach", post(attach_session))
}
