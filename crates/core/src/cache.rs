//! Persisted session cache.
//!
//! A versioned JSON document written across restarts so the daemon can serve
//! session listings before the first full rescan completes. The cache never
//! stores file mtimes, so the first rescan after a restart re-parses every
//! log file; `multiplexer_status` is reset to `none` on load because tab
//! state from a previous daemon life is meaningless.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{MultiplexerStatus, SessionMetadata};

/// Current on-disk schema version. Loads of any other version are rejected.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<SessionMetadata>,
    last_full_scan: DateTime<Utc>,
}

/// Load cached metadata, or `None` when the file is missing, malformed, or
/// of an unsupported version.
pub fn load(path: &Path) -> Option<Vec<SessionMetadata>> {
    let contents = fs::read_to_string(path).ok()?;
    let file: CacheFile = match serde_json::from_str(&contents) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Discarding malformed session cache");
            return None;
        }
    };
    if file.version != CACHE_VERSION {
        warn!(
            path = %path.display(),
            found = file.version,
            supported = CACHE_VERSION,
            "Discarding session cache with unsupported version"
        );
        return None;
    }
    let mut entries = file.entries;
    for entry in &mut entries {
        entry.multiplexer_status = MultiplexerStatus::None;
    }
    Some(entries)
}

/// Persist the cache atomically: write a sibling temp file, fix its mode to
/// 0600, then rename over the target. The parent directory is created with
/// mode 0700 if absent.
pub fn save(
    path: &Path,
    entries: &[SessionMetadata],
    last_full_scan: DateTime<Utc>,
) -> io::Result<()> {
    let file = CacheFile {
        version: CACHE_VERSION,
        entries: entries.to_vec(),
        last_full_scan,
    };
    let json = serde_json::to_string(&file)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    fs::rename(&tmp, path)?;
    Ok(())
}
