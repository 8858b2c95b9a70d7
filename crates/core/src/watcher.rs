//! Filesystem watcher for session log files.
//!
//! Watches the log root recursively and forwards add/change/unlink events
//! for files with the configured extension into tokio. Writes to a live log
//! are rapid appends, so consumers coalesce events behind a quiescence
//! window (see [`debounce`]) before re-parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::error;

/// Events emitted by the watcher, pre-filtered to session log files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A log file appeared or grew.
    Modified(PathBuf),
    /// A log file was removed from disk.
    Removed(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Modified(p) | Self::Removed(p) => p,
        }
    }
}

/// Install a recursive watcher on `root`, forwarding events for `*.{ext}`
/// files through `tx`. The returned handle must be kept alive for the
/// duration of monitoring; dropping it stops the watch.
pub fn start_watcher(
    root: &Path,
    ext: &str,
    tx: mpsc::Sender<FileEvent>,
) -> notify::Result<RecommendedWatcher> {
    let ext = ext.to_string();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                for path in event
                    .paths
                    .iter()
                    .filter(|p| p.extension().map(|e| e == ext.as_str()).unwrap_or(false))
                {
                    let file_event = match event.kind {
                        EventKind::Remove(_) => FileEvent::Removed(path.clone()),
                        EventKind::Create(_) | EventKind::Modify(_) => {
                            FileEvent::Modified(path.clone())
                        }
                        _ => continue,
                    };
                    // Best-effort: a dropped event is recovered by the next
                    // periodic rescan.
                    let _ = tx.try_send(file_event);
                }
            }
            Err(e) => {
                error!(error = %e, "Session log watcher error");
            }
        })?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Coalesce raw watcher events behind a quiescence window.
///
/// Events for the same path collapse to the most recent one; the batch is
/// released only after `quiet` elapses with no further activity, so a log
/// mid-append is not parsed in a torn state. Runs until `rx` closes.
pub async fn debounce(
    mut rx: mpsc::Receiver<FileEvent>,
    quiet: Duration,
    out: mpsc::Sender<FileEvent>,
) {
    let mut pending: HashMap<PathBuf, FileEvent> = HashMap::new();
    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(ev) => {
                    pending.insert(ev.path().to_path_buf(), ev);
                }
                None => return,
            }
            continue;
        }

        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    pending.insert(ev.path().to_path_buf(), ev);
                }
                None => {
                    for (_, ev) in pending.drain() {
                        let _ = out.send(ev).await;
                    }
                    return;
                }
            },
            _ = tokio::time::sleep(quiet) => {
                for (_, ev) in pending.drain() {
                    if out.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
