//! Daemon configuration.
//!
//! Loaded from `~/.config/claude-relay/config.yaml`. On first run the file
//! is generated with a fresh random pre-shared key; the config directory is
//! created mode 0700 and the file mode 0600 since it holds the secret.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of the generated pre-shared key, in raw bytes before encoding.
const PSK_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen port.
    pub port: u16,
    /// Bind address.
    pub host: String,
    pub auth: AuthConfig,
    pub tmux: TmuxConfig,
    pub claude: ClaudeConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer credential required by every authenticated endpoint.
    pub psk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    /// Initial PTY size for new tabs.
    pub default_cols: u16,
    pub default_rows: u16,
    /// Advisory scrollback depth for new tabs.
    pub scrollback_lines: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    /// CLI binary launched inside multiplexer tabs.
    pub binary: String,
    /// Session log root. Defaults to `~/.claude/projects`.
    pub session_dir: PathBuf,
    /// Cap on concurrently existing tabs.
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// WebSocket ping interval, seconds.
    pub ws_heartbeat: u64,
    /// Missed pongs tolerated before the socket is force-closed.
    pub ws_max_missed_pongs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7860,
            host: "0.0.0.0".to_string(),
            auth: AuthConfig::default(),
            tmux: TmuxConfig::default(),
            claude: ClaudeConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { psk: String::new() }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            default_cols: 120,
            default_rows: 40,
            scrollback_lines: 10_000,
        }
    }
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            session_dir: claude_relay_core::paths::default_session_root()
                .unwrap_or_else(|_| PathBuf::from("/")),
            max_sessions: 5,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ws_heartbeat: 30,
            ws_max_missed_pongs: 3,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid YAML configuration")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Load the config, generating it with a fresh PSK on first run.
    ///
    /// An unreadable or unparsable file is fatal, as is an empty `auth.psk`
    /// in an existing file; the daemon must never come up unauthenticated.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Cannot read config file {}", path.display()))?;
            let config = Self::from_yaml(&contents)
                .with_context(|| format!("Cannot parse config file {}", path.display()))?;
            if config.auth.psk.is_empty() {
                bail!(
                    "auth.psk is empty in {}; delete the file to regenerate it",
                    path.display()
                );
            }
            return Ok(config);
        }

        let mut config = Self::default();
        config.auth.psk = generate_psk();
        config.write_to(path)?;
        tracing::info!(path = %path.display(), "Generated config with a fresh pre-shared key");
        Ok(config)
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create config directory {}", parent.display()))?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
        fs::write(path, self.to_yaml()?)
            .with_context(|| format!("Cannot write config file {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

/// 32 random bytes, base64url without padding.
fn generate_psk() -> String {
    let mut bytes = [0u8; PSK_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
