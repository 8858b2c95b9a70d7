//! Error types for session discovery and log parsing.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the session index and path resolution.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("session root not found: {path}")]
    RootNotFound { path: PathBuf },

    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install filesystem watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("home directory could not be determined")]
    HomeDirNotFound,
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::RootNotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors from parsing a single session log.
///
/// The index maps all of these to its degrade policy (placeholder on first
/// sight, keep existing metadata otherwise); they never abort a scan pass.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("session log not found: {path}")]
    NotFound { path: PathBuf },

    #[error("permission denied reading session log: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("I/O error reading session log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no parseable records in {path}")]
    NoRecords { path: PathBuf },
}

impl ParseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}
