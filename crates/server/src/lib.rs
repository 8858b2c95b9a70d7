//! claude-relay server library.
//!
//! Wires the session index (from `claude-relay-core`) to the multiplexer
//! manager and terminal bridge, and exposes the authenticated HTTP +
//! WebSocket surface on top.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tmux;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;

use crate::bridge::{BridgeSettings, TerminalBridges};
use crate::tmux::TmuxManager;
use claude_relay_core::SessionIndex;

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat: Duration::from_secs(config.rate_limit.ws_heartbeat),
            max_missed_pongs: config.rate_limit.ws_max_missed_pongs,
            ..Self::default()
        }
    }
}

/// Assemble shared state. The bridge registry doubles as the manager's
/// active-attachment probe.
pub fn build_state(
    config: Config,
    index: SessionIndex,
    bridges: TerminalBridges,
    cli_version: String,
) -> Arc<AppState> {
    let tmux = TmuxManager::new(&config, Arc::new(bridges.clone()));
    Arc::new(AppState {
        start_time: Instant::now(),
        config,
        index,
        tmux,
        bridges,
        cli_version,
        attach_attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
    })
}

/// Build the full router for the given state.
pub fn create_app(state: Arc<AppState>) -> Router {
    routes::api_routes(state)
}

/// Best-effort probe of the CLI's version string for the status endpoint.
pub async fn probe_cli_version(binary: &str) -> String {
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(binary).arg("--version").output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cli_version_probe_tolerates_missing_binary() {
        let version = probe_cli_version("/definitely/not/a/binary").await;
        assert_eq!(version, "");
    }

    #[test]
    fn bridge_settings_follow_config() {
        let mut config = Config::default();
        config.rate_limit.ws_heartbeat = 7;
        config.rate_limit.ws_max_missed_pongs = 9;
        let settings = BridgeSettings::from_config(&config);
        assert_eq!(settings.heartbeat, Duration::from_secs(7));
        assert_eq!(settings.max_missed_pongs, 9);
        // The attach command template is not configuration.
        assert_eq!(settings.attach_command[0], "tmux");
    }
}
