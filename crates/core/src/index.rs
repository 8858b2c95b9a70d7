//! The live session index.
//!
//! Keeps an in-memory `{id -> metadata}` map in sync with the on-disk log
//! root through three mechanisms: a recursive filesystem watcher (coalesced
//! behind a quiescence window), a periodic full rescan, and a persisted
//! cache that seeds the map across restarts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::RecommendedWatcher;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache;
use crate::error::IndexError;
use crate::parser;
use crate::types::{MultiplexerStatus, SessionMetadata};
use crate::watcher::{self, FileEvent};

/// Default interval between full rescans.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(120);
/// Default quiescence window for watcher events.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// Default log file extension.
pub const DEFAULT_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Root directory: one subdirectory per project, log files inside.
    pub root: PathBuf,
    /// Log file extension, without the dot.
    pub extension: String,
    /// Location of the persisted cache.
    pub cache_path: PathBuf,
    pub rescan_interval: Duration,
    pub debounce_window: Duration,
}

impl IndexConfig {
    pub fn new(root: PathBuf, cache_path: PathBuf) -> Self {
        Self {
            root,
            extension: DEFAULT_EXTENSION.to_string(),
            cache_path,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
        }
    }
}

/// Queryable view of all sessions under the log root.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SessionIndex {
    inner: Arc<Inner>,
}

struct Inner {
    config: IndexConfig,
    sessions: RwLock<HashMap<String, SessionMetadata>>,
    /// `{file_path -> mtime_nanos}` used to skip unchanged files during
    /// rescans. Never persisted.
    mtimes: Mutex<HashMap<PathBuf, u128>>,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: RwLock::new(HashMap::new()),
                mtimes: Mutex::new(HashMap::new()),
                watcher: std::sync::Mutex::new(None),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Load the persisted cache, run an initial full rescan, then install the
    /// filesystem watcher and the periodic rescan timer.
    ///
    /// A watcher installation failure is returned after the rescan timer is
    /// already in place, so a caller may treat it as degraded service (the
    /// periodic rescan still keeps the index converging) rather than fatal.
    pub async fn start(&self) -> Result<(), IndexError> {
        if let Some(cached) = cache::load(&self.inner.config.cache_path) {
            let mut sessions = self.inner.sessions.write().await;
            for entry in cached {
                sessions.insert(entry.id.clone(), entry);
            }
            info!(sessions = sessions.len(), "Seeded session index from cache");
        }

        if let Err(e) = self.inner.rescan().await {
            // An absent or unreadable root yields an empty index until a
            // later pass succeeds.
            warn!(error = %e, "Initial rescan failed");
        }

        let (raw_tx, raw_rx) = mpsc::channel(256);
        let (event_tx, mut event_rx) = mpsc::channel(256);
        {
            let debounce_window = self.inner.config.debounce_window;
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.push(tokio::spawn(watcher::debounce(
                raw_rx,
                debounce_window,
                event_tx,
            )));

            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    inner.apply_event(event).await;
                }
            }));

            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(inner.config.rescan_interval);
                interval.tick().await; // the initial rescan already ran
                loop {
                    interval.tick().await;
                    if let Err(e) = inner.rescan().await {
                        warn!(error = %e, "Periodic rescan failed");
                    }
                }
            }));
        }

        if !self.inner.config.root.exists() {
            // Nothing to watch yet; the rescan timer picks the root up once
            // it appears.
            warn!(
                root = %self.inner.config.root.display(),
                "Session root does not exist; watcher idle"
            );
            return Ok(());
        }
        let w = watcher::start_watcher(
            &self.inner.config.root,
            &self.inner.config.extension,
            raw_tx,
        )?;
        *self.inner.watcher.lock().unwrap() = Some(w);
        info!(root = %self.inner.config.root.display(), "Watching session log root");
        Ok(())
    }

    /// Cancel the watcher and timers and flush the cache.
    pub async fn stop(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.watcher.lock().unwrap().take();
        self.inner.flush_cache().await;
    }

    /// All metadata, newest first.
    pub async fn list(&self) -> Vec<SessionMetadata> {
        let sessions = self.inner.sessions.read().await;
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all
    }

    pub async fn get(&self, id: &str) -> Option<SessionMetadata> {
        self.inner.sessions.read().await.get(id).cloned()
    }

    /// Sessions grouped by `project_path` (or `project_hash` when the path is
    /// empty), each group newest first.
    pub async fn by_project(&self) -> HashMap<String, Vec<SessionMetadata>> {
        let sessions = self.inner.sessions.read().await;
        let mut groups: HashMap<String, Vec<SessionMetadata>> = HashMap::new();
        for meta in sessions.values() {
            let key = if meta.project_path.is_empty() {
                meta.project_hash.clone()
            } else {
                meta.project_path.clone()
            };
            groups.entry(key).or_default().push(meta.clone());
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
        groups
    }

    /// Update the advisory tab status. Returns false for unknown ids.
    pub async fn set_multiplexer_status(&self, id: &str, status: MultiplexerStatus) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(id) {
            Some(meta) => {
                meta.multiplexer_status = status;
                true
            }
            None => false,
        }
    }

    /// Run a full rescan now. The periodic timer does this on its own; the
    /// entry point exists for startup and tests. An unreadable root is an
    /// error, distinct from an empty one.
    pub async fn rescan(&self) -> Result<(), IndexError> {
        self.inner.rescan().await
    }
}

impl Inner {
    /// Full rescan: walk every project directory, re-parse files whose mtime
    /// moved, drop ids whose files are gone, persist the cache.
    async fn rescan(&self) -> Result<(), IndexError> {
        let mut observed: HashSet<String> = HashSet::new();
        let mut seen_paths: HashSet<PathBuf> = HashSet::new();

        let mut dirs = tokio::fs::read_dir(&self.config.root)
            .await
            .map_err(|e| IndexError::io(self.config.root.clone(), e))?;

        while let Ok(Some(dir_entry)) = dirs.next_entry().await {
            let dir_path = dir_entry.path();
            if !dir_path.is_dir() {
                continue;
            }
            let project_hash = dir_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let mut files = match tokio::fs::read_dir(&dir_path).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(dir = %dir_path.display(), error = %e, "Project directory unreadable");
                    continue;
                }
            };
            while let Ok(Some(file_entry)) = files.next_entry().await {
                let path = file_entry.path();
                if path.extension().map(|e| e != self.config.extension.as_str()).unwrap_or(true) {
                    continue;
                }
                let Some(id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    continue;
                };
                seen_paths.insert(path.clone());
                self.scan_file(&path, &id, &project_hash, &mut observed).await;
            }
        }

        {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            // A tab or bridge observation keeps an entry alive even after its
            // log file disappears; the status decays to `none` once the tab
            // is gone and the next pass removes it.
            sessions.retain(|id, meta| {
                observed.contains(id) || meta.multiplexer_status != MultiplexerStatus::None
            });
            let removed = before - sessions.len();
            if removed > 0 {
                debug!(removed, "Pruned sessions whose log files disappeared");
            }
        }
        self.mtimes.lock().await.retain(|path, _| seen_paths.contains(path));

        self.flush_cache().await;
        Ok(())
    }

    /// One file of the rescan pass: mtime-skip, re-parse, or degrade.
    async fn scan_file(
        &self,
        path: &Path,
        id: &str,
        project_hash: &str,
        observed: &mut HashSet<String>,
    ) {
        let mtime_nanos = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(t) => t
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Stat failed for session log");
                if self.degrade_entry(id, project_hash).await {
                    observed.insert(id.to_string());
                }
                return;
            }
        };

        {
            let mut mtimes = self.mtimes.lock().await;
            if mtimes.get(path) == Some(&mtime_nanos) {
                if self.sessions.read().await.contains_key(id) {
                    observed.insert(id.to_string());
                }
                return;
            }
            mtimes.insert(path.to_path_buf(), mtime_nanos);
        }

        match parser::parse_session_file(path, id, project_hash).await {
            Ok(Some(mut meta)) => {
                let mut sessions = self.sessions.write().await;
                if let Some(existing) = sessions.get(id) {
                    meta.multiplexer_status = existing.multiplexer_status;
                }
                sessions.insert(id.to_string(), meta);
                observed.insert(id.to_string());
            }
            Ok(None) => {
                // Zero-length file: no metadata, and any stale entry for this
                // id is pruned at the end of the pass.
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Session log unreadable");
                if self.degrade_entry(id, project_hash).await {
                    observed.insert(id.to_string());
                }
            }
        }
    }

    /// Read/stat failure policy: existing metadata is left untouched; a
    /// first-seen session gets a placeholder. Returns whether an entry exists
    /// afterwards.
    async fn degrade_entry(&self, id: &str, project_hash: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(id) {
            sessions.insert(id.to_string(), parser::placeholder_metadata(id, project_hash));
        }
        true
    }

    /// Incremental watcher event, same per-file contract as the rescan.
    async fn apply_event(&self, event: FileEvent) {
        match event {
            FileEvent::Modified(path) => {
                let Some(id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    return;
                };
                let project_hash = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let mut observed = HashSet::new();
                self.scan_file(&path, &id, &project_hash, &mut observed).await;
            }
            FileEvent::Removed(path) => {
                let Some(id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    return;
                };
                self.sessions.write().await.remove(&id);
                self.mtimes.lock().await.remove(&path);
                debug!(session_id = %id, "Removed session after log unlink");
            }
        }
    }

    async fn flush_cache(&self) {
        let snapshot: Vec<_> = self.sessions.read().await.values().cloned().collect();
        if let Err(e) = cache::save(&self.config.cache_path, &snapshot, Utc::now()) {
            warn!(
                path = %self.config.cache_path.display(),
                error = %e,
                "Failed to persist session cache"
            );
        }
    }
}
