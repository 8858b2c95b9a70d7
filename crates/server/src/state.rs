//! Shared application state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use claude_relay_core::SessionIndex;

use crate::bridge::TerminalBridges;
use crate::config::Config;
use crate::tmux::TmuxManager;

pub struct AppState {
    pub start_time: Instant,
    pub config: Config,
    pub index: SessionIndex,
    pub tmux: TmuxManager,
    pub bridges: TerminalBridges,
    /// Output of `<cli_binary> --version`, probed once at startup.
    pub cli_version: String,
    /// Per-session attach rate limit: id -> last attempt.
    pub attach_attempts: Mutex<HashMap<String, Instant>>,
}
