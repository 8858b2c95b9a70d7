//! Session metadata and the jsonl record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of the most recent message in a session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    #[default]
    Unknown,
}

/// Last observed state of the session's multiplexer tab.
///
/// Advisory: reflects the most recent observation and may be stale between
/// tab queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerStatus {
    /// A tab exists and a client is attached to it.
    Active,
    /// A tab exists with no attached client.
    Detached,
    /// No tab exists for this session.
    #[default]
    None,
}

/// Everything the daemon knows about one session.
///
/// `id` is byte-for-byte the log file's basename (sans extension);
/// `project_hash` is the basename of the containing directory and is treated
/// as opaque. `timestamp` is the log file's mtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub project_path: String,
    pub project_hash: String,
    pub last_message_preview: String,
    pub last_message_role: MessageRole,
    pub timestamp: DateTime<Utc>,
    pub cli_version: String,
    pub multiplexer_status: MultiplexerStatus,
}

/// One line of a session log. Only the fields the index cares about; every
/// record is independently parseable and unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "type")]
    pub record_type: Option<String>,
    #[serde(default)]
    pub message: Option<LogMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// `message.content` is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(default, rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl LogRecord {
    /// Role carried by this record, or `None` when it is not a message record.
    pub fn role(&self) -> Option<MessageRole> {
        match self.record_type.as_deref() {
            Some("user") => Some(MessageRole::User),
            Some("assistant") => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}
