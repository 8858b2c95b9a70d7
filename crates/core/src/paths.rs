//! Centralized path functions for daemon storage locations.

use std::path::PathBuf;

use crate::error::IndexError;

/// Default session log root: `~/.claude/projects`.
pub fn default_session_root() -> Result<PathBuf, IndexError> {
    let home = dirs::home_dir().ok_or(IndexError::HomeDirNotFound)?;
    Ok(home.join(".claude").join("projects"))
}

/// Daemon config directory: `~/.config/claude-relay`.
pub fn config_dir() -> Result<PathBuf, IndexError> {
    let home = dirs::home_dir().ok_or(IndexError::HomeDirNotFound)?;
    Ok(home.join(".config").join("claude-relay"))
}

/// Config file: `<config_dir>/config.yaml`.
pub fn config_file() -> Result<PathBuf, IndexError> {
    Ok(config_dir()?.join("config.yaml"))
}

/// Persisted session cache: `<config_dir>/session-cache.json`.
pub fn cache_file() -> Result<PathBuf, IndexError> {
    Ok(config_dir()?.join("session-cache.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_root_under_claude_dir() {
        let root = default_session_root().unwrap();
        assert!(root.ends_with(".claude/projects"));
    }

    #[test]
    fn cache_file_under_config_dir() {
        let path = cache_file().unwrap();
        assert!(path.to_string_lossy().contains("claude-relay"));
        assert!(path.ends_with("session-cache.json"));
    }
}
