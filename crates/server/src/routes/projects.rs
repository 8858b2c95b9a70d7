//! Project roll-up endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub project_path: String,
    pub project_name: String,
    pub session_count: usize,
    pub latest_timestamp: DateTime<Utc>,
}

/// GET /api/projects — one row per project, most recently active first.
async fn list_projects(State(state): State<Arc<AppState>>) -> Json<Vec<ProjectSummary>> {
    let mut projects: Vec<ProjectSummary> = state
        .index
        .by_project()
        .await
        .into_iter()
        .filter_map(|(key, sessions)| {
            // Groups are newest-first already; an empty group cannot occur
            // but is skipped rather than unwrapped.
            let latest = sessions.first()?.timestamp;
            let name = key
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .unwrap_or(&key)
                .to_string();
            Some(ProjectSummary {
                project_name: name,
                session_count: sessions.len(),
                latest_timestamp: latest,
                project_path: key,
            })
        })
        .collect();

    projects.sort_by(|a, b| b.latest_timestamp.cmp(&a.latest_timestamp));
    Json(projects)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/projects", get(list_projects))
}
