//! Multiplexer manager.
//!
//! All interaction with the external `tmux` binary lives here: tab naming,
//! listing, creation and teardown, plus the preconditions for attach. Attach
//! operations are serialized per session id; independent sessions proceed in
//! parallel.
//!
//! Failures that mean "no such tab / no such process" are silent successes.
//! Anything else (binary missing, permission denied) surfaces as a command
//! error which callers map to a 5xx.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Prefix for tab names; `tab_name(id) = "<prefix>-<id>"` is the sole link
/// between tmux tab identity and session identity.
pub const DEFAULT_TAB_PREFIX: &str = "claude";

/// Deadline applied to every external command invocation.
const COMMAND_DEADLINE: Duration = Duration::from_secs(5);

/// Narrow view of the terminal bridge: is a remote byte stream currently
/// attached to this session? Injected at construction so the manager stays
/// testable with a stub and carries no reference back to the bridge.
pub trait ActiveBridges: Send + Sync {
    fn has_active(&self, session_id: &str) -> bool;
}

/// One multiplexer tab as reported by `tmux list-sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxTab {
    pub name: String,
    pub attached: bool,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("session already has an active terminal connection")]
    SessionAttached,
    #[error("a host-side process is already using this session")]
    SessionConflict,
    #[error("tab cap of {0} reached")]
    MaxSessions(usize),
    #[error("multiplexer command failed: {0}")]
    Command(String),
}

pub struct TmuxManager {
    prefix: String,
    cli_binary: String,
    default_cols: u16,
    default_rows: u16,
    max_sessions: usize,
    bridges: Arc<dyn ActiveBridges>,
    locks: SessionLocks,
}

impl TmuxManager {
    pub fn new(config: &Config, bridges: Arc<dyn ActiveBridges>) -> Self {
        Self {
            prefix: DEFAULT_TAB_PREFIX.to_string(),
            cli_binary: config.claude.binary.clone(),
            default_cols: config.tmux.default_cols,
            default_rows: config.tmux.default_rows,
            max_sessions: config.claude.max_sessions,
            bridges,
            locks: SessionLocks::default(),
        }
    }

    pub fn tab_name(&self, session_id: &str) -> String {
        format!("{}-{}", self.prefix, session_id)
    }

    /// Recover the session id from a tab name, if the tab is ours.
    pub fn session_id_of<'a>(&self, tab_name: &'a str) -> Option<&'a str> {
        tab_name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|id| !id.is_empty())
    }

    /// Prepare a tab for `session_id`, creating one if absent. Returns the
    /// tab name and whether it already existed. Serialized per id.
    pub async fn attach(&self, session_id: &str) -> Result<(String, bool), AttachError> {
        let _guard = self.locks.acquire(session_id).await;

        if self.bridges.has_active(session_id) {
            return Err(AttachError::SessionAttached);
        }
        if self.process_conflict(session_id).await {
            return Err(AttachError::SessionConflict);
        }

        let name = self.tab_name(session_id);
        let ours = self.list_ours().await?;
        if ours.len() >= self.max_sessions && !ours.iter().any(|t| t.name == name) {
            return Err(AttachError::MaxSessions(self.max_sessions));
        }

        if self.has_tab(&name).await {
            debug!(session_id, tab = %name, "Reusing existing tab");
            return Ok((name, true));
        }

        self.create_tab(&name, session_id).await?;
        info!(session_id, tab = %name, "Created detached tab");
        Ok((name, false))
    }

    /// All tabs known to the multiplexer. An unlistable server (commonly:
    /// tmux not running yet) is an empty list, not an error.
    pub async fn list_all(&self) -> Result<Vec<TmuxTab>, AttachError> {
        let output = run(
            "tmux",
            &[
                "list-sessions",
                "-F",
                "#{session_name}\t#{session_attached}\t#{session_created}",
            ],
        )
        .await?;
        if !output.status.success() {
            // `tmux list-sessions` fails when no server is running.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_list_line)
            .collect())
    }

    /// Tabs carrying our prefix.
    pub async fn list_ours(&self) -> Result<Vec<TmuxTab>, AttachError> {
        let mut tabs = self.list_all().await?;
        tabs.retain(|t| self.session_id_of(&t.name).is_some());
        Ok(tabs)
    }

    pub async fn has_tab(&self, name: &str) -> bool {
        match run("tmux", &["has-session", "-t", name]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn create_tab(&self, name: &str, session_id: &str) -> Result<(), AttachError> {
        let command = format!("{} --resume {}", self.cli_binary, session_id);
        let cols = self.default_cols.to_string();
        let rows = self.default_rows.to_string();
        let output = run(
            "tmux",
            &[
                "new-session", "-d", "-s", name, "-x", &cols, "-y", &rows, &command,
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(AttachError::Command(format!(
                "tmux new-session failed for {name}"
            )));
        }
        Ok(())
    }

    /// Best-effort kill; a missing tab is not an error.
    pub async fn kill(&self, name: &str) {
        if let Err(e) = run("tmux", &["kill-session", "-t", name]).await {
            debug!(tab = %name, error = %e, "kill-session failed");
        }
    }

    /// Startup reconciliation: reap attach children orphaned by a previous
    /// daemon life, then report the ids of tabs that still exist so the
    /// index can mark them detached.
    pub async fn reconcile(&self) -> Vec<String> {
        let pattern = format!("tmux attach-session -t {}-", self.prefix);
        if let Err(e) = run("pkill", &["-f", &pattern]).await {
            debug!(error = %e, "Orphan reap skipped");
        }

        match self.list_ours().await {
            Ok(tabs) => {
                if !tabs.is_empty() {
                    info!(tabs = tabs.len(), "Found surviving tabs from a previous run");
                }
                tabs.iter()
                    .filter_map(|t| self.session_id_of(&t.name).map(str::to_string))
                    .collect()
            }
            Err(e) => {
                warn!(error = %e, "Could not enumerate tabs during reconcile");
                Vec::new()
            }
        }
    }

    /// Command-line scan for a competing host-side CLI using this session.
    /// A non-zero `pgrep` exit means no match; empty stdout likewise.
    async fn process_conflict(&self, session_id: &str) -> bool {
        let pattern = process_match_pattern(&self.cli_binary, session_id);
        match run("pgrep", &["-f", &pattern]).await {
            Ok(output) => {
                output.status.success() && !output.stdout.iter().all(u8::is_ascii_whitespace)
            }
            Err(_) => false,
        }
    }
}

/// `<binary>.*--resume.*<escaped id>`, fed to `pgrep -f`.
pub fn process_match_pattern(cli_binary: &str, session_id: &str) -> String {
    format!("{}.*--resume.*{}", cli_binary, regex_escape(session_id))
}

/// Escape regex metacharacters before interpolating an id into a pattern.
pub fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn parse_list_line(line: &str) -> Option<TmuxTab> {
    let mut fields = line.split('\t');
    let name = fields.next()?.to_string();
    let attached = fields.next()?.parse::<u32>().ok()? > 0;
    let created_secs = fields.next()?.parse::<i64>().ok()?;
    Some(TmuxTab {
        name,
        attached,
        created: DateTime::from_timestamp(created_secs, 0)?,
    })
}

async fn run(binary: &str, args: &[&str]) -> Result<std::process::Output, AttachError> {
    let result = tokio::time::timeout(
        COMMAND_DEADLINE,
        Command::new(binary).args(args).kill_on_drop(true).output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AttachError::Command(format!("{binary}: {e}"))),
        Err(_) => Err(AttachError::Command(format!(
            "{binary} exceeded the {}s deadline",
            COMMAND_DEADLINE.as_secs()
        ))),
    }
}

/// Per-session-id FIFO serialization.
///
/// A map of shared async mutexes; acquiring first drops entries nobody else
/// holds, so ids that saw a burst of attaches do not leak map rows. tokio's
/// mutex queues waiters fairly, which gives the per-id FIFO ordering.
#[derive(Default)]
struct SessionLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().await;
            map.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(map.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
