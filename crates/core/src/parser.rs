//! Bounded parsing of session log files.
//!
//! A session log is line-delimited JSON. The index never parses the whole
//! file: it reads a bounded header window for `cwd`/`version` and a bounded
//! tail window for the most recent message. Malformed lines are skipped per
//! record and never abort the file.

use std::io::SeekFrom;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::ParseError;
use crate::types::{
    LogRecord, MessageContent, MessageRole, MultiplexerStatus, SessionMetadata,
};

/// Bytes read from the start of the file for the header scan.
const HEADER_READ_BYTES: u64 = 128 * 1024;
/// Non-blank lines considered during the header scan.
const HEADER_SCAN_LINES: usize = 20;
/// Bytes read from the end of the file for the tail scan.
const TAIL_READ_BYTES: u64 = 4 * 1024;
/// Maximum preview length in code points, before the ellipsis.
const PREVIEW_MAX_CHARS: usize = 200;

/// Preview shown for a session whose log could not be read.
pub const UNREADABLE_PREVIEW: &str = "(unable to read)";

/// Parse a session log into fresh metadata.
///
/// Returns `Ok(None)` for a zero-length file. Failures bubble up as
/// [`ParseError`] so the caller can decide between a placeholder entry and
/// leaving an existing one untouched. `multiplexer_status` is always `None`
/// here; the caller carries any prior observation over.
pub async fn parse_session_file(
    path: &Path,
    id: &str,
    project_hash: &str,
) -> Result<Option<SessionMetadata>, ParseError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ParseError::io(path, e))?;
    let meta = file.metadata().await.map_err(|e| ParseError::io(path, e))?;
    let len = meta.len();
    if len == 0 {
        return Ok(None);
    }
    let timestamp: DateTime<Utc> = meta.modified().map_err(|e| ParseError::io(path, e))?.into();

    let mut out = SessionMetadata {
        id: id.to_string(),
        project_path: String::new(),
        project_hash: project_hash.to_string(),
        last_message_preview: String::new(),
        last_message_role: MessageRole::Unknown,
        timestamp,
        cli_version: String::new(),
        multiplexer_status: MultiplexerStatus::None,
    };

    // Header: up to 128 KiB, first 20 non-blank lines.
    let head_len = len.min(HEADER_READ_BYTES);
    let mut head = vec![0u8; head_len as usize];
    file.seek(SeekFrom::Start(0))
        .await
        .map_err(|e| ParseError::io(path, e))?;
    file.read_exact(&mut head)
        .await
        .map_err(|e| ParseError::io(path, e))?;
    let head_parsed = scan_header(&String::from_utf8_lossy(&head), &mut out);

    // Tail: up to 4 KiB from EOF. When the window starts mid-file the first
    // line is a partial record and gets dropped.
    let tail_len = len.min(TAIL_READ_BYTES);
    let tail_start = len - tail_len;
    let mut tail = vec![0u8; tail_len as usize];
    file.seek(SeekFrom::Start(tail_start))
        .await
        .map_err(|e| ParseError::io(path, e))?;
    file.read_exact(&mut tail)
        .await
        .map_err(|e| ParseError::io(path, e))?;
    let tail_parsed = scan_tail(&String::from_utf8_lossy(&tail), tail_start > 0, &mut out);

    // A file in which no line parses at all is indistinguishable from a
    // corrupt one; report it so the caller applies the placeholder-or-keep
    // policy.
    if !head_parsed && !tail_parsed {
        return Err(ParseError::NoRecords {
            path: path.to_path_buf(),
        });
    }

    if out.project_path.is_empty() {
        out.project_path = fallback_project_path(project_hash);
    }

    Ok(Some(out))
}

/// Placeholder entry for a session whose log failed to read or stat and which
/// has no prior metadata.
pub fn placeholder_metadata(id: &str, project_hash: &str) -> SessionMetadata {
    SessionMetadata {
        id: id.to_string(),
        project_path: String::new(),
        project_hash: project_hash.to_string(),
        last_message_preview: UNREADABLE_PREVIEW.to_string(),
        last_message_role: MessageRole::Unknown,
        timestamp: Utc::now(),
        cli_version: String::new(),
        multiplexer_status: MultiplexerStatus::None,
    }
}

fn scan_header(head: &str, out: &mut SessionMetadata) -> bool {
    let mut parsed_any = false;
    for line in head
        .split('\n')
        .filter(|l| !l.trim().is_empty())
        .take(HEADER_SCAN_LINES)
    {
        let Ok(rec) = serde_json::from_str::<LogRecord>(line) else {
            continue;
        };
        parsed_any = true;
        if out.project_path.is_empty() {
            if let Some(cwd) = rec.cwd.filter(|c| !c.is_empty()) {
                out.project_path = cwd;
            }
        }
        if out.cli_version.is_empty() {
            if let Some(version) = rec.version.filter(|v| !v.is_empty()) {
                out.cli_version = version;
            }
        }
        if !out.project_path.is_empty() && !out.cli_version.is_empty() {
            break;
        }
    }
    parsed_any
}

fn scan_tail(tail: &str, starts_mid_file: bool, out: &mut SessionMetadata) -> bool {
    let mut parsed_any = false;
    let mut lines: Vec<&str> = tail.split('\n').collect();
    if starts_mid_file && !lines.is_empty() {
        lines.remove(0);
    }
    for line in lines.iter().rev().filter(|l| !l.trim().is_empty()) {
        let Ok(rec) = serde_json::from_str::<LogRecord>(line) else {
            continue;
        };
        parsed_any = true;
        let Some(role) = rec.role() else { continue };
        out.last_message_role = role;
        out.last_message_preview = rec
            .message
            .and_then(|m| m.content)
            .map(|c| extract_preview(&c))
            .unwrap_or_default();
        if let Some(version) = rec.version.filter(|v| !v.is_empty()) {
            out.cli_version = version;
        }
        break;
    }
    parsed_any
}

/// Pull the preview text out of a message body and truncate it.
///
/// String content is used directly; block content supplies the first `text`
/// block. Anything else yields an empty preview.
pub fn extract_preview(content: &MessageContent) -> String {
    let text = match content {
        MessageContent::Text(s) => s.as_str(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
            .unwrap_or(""),
    };
    truncate_preview(text)
}

/// Truncate to 200 code points, appending `"..."` when anything was cut.
pub fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    out.push_str("...");
    out
}

/// Synthesize a project path from an encoded directory name when no `cwd`
/// record was found: `-Users-x-app` becomes `/Users/x/app`.
pub fn fallback_project_path(project_hash: &str) -> String {
    if project_hash.is_empty() {
        return String::new();
    }
    let stripped = project_hash.strip_prefix('-').unwrap_or(project_hash);
    format!("/{}", stripped.replace('-', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    async fn parse_str(content: &str) -> Option<SessionMetadata> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, content).unwrap();
        parse_session_file(&path, "s", "-proj-a").await.unwrap()
    }

    #[tokio::test]
    async fn empty_file_produces_no_metadata() {
        assert!(parse_str("").await.is_none());
    }

    #[tokio::test]
    async fn header_and_tail_fields_extracted() {
        let meta = parse_str(concat!(
            "{\"cwd\":\"/Users/x/app\",\"version\":\"2.1.37\"}\n",
            "{\"type\":\"user\",\"message\":{\"content\":\"hello\"}}\n",
        ))
        .await
        .unwrap();
        assert_eq!(meta.project_path, "/Users/x/app");
        assert_eq!(meta.cli_version, "2.1.37");
        assert_eq!(meta.last_message_role, MessageRole::User);
        assert_eq!(meta.last_message_preview, "hello");
    }

    #[tokio::test]
    async fn tail_prefers_last_message_record() {
        let meta = parse_str(concat!(
            "{\"cwd\":\"/w\"}\n",
            "{\"type\":\"user\",\"message\":{\"content\":\"first\"}}\n",
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"second\"}]}}\n",
            "{\"type\":\"summary\"}\n",
        ))
        .await
        .unwrap();
        assert_eq!(meta.last_message_role, MessageRole::Assistant);
        assert_eq!(meta.last_message_preview, "second");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let meta = parse_str(concat!(
            "not json at all {{{\n",
            "{\"cwd\":\"/w\"}\n",
            "}}}\n",
            "{\"type\":\"user\",\"message\":{\"content\":\"ok\"}}\n",
            "broken trailing line {{{\n",
        ))
        .await
        .unwrap();
        assert_eq!(meta.project_path, "/w");
        assert_eq!(meta.last_message_preview, "ok");
    }

    #[tokio::test]
    async fn solely_malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, "garbage\nmore garbage\n").unwrap();
        let err = parse_session_file(&path, "s", "-p").await.unwrap_err();
        assert!(matches!(err, ParseError::NoRecords { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = parse_session_file(Path::new("/nonexistent/s.jsonl"), "s", "-p")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn small_file_tail_keeps_first_line() {
        // File shorter than the tail window: the read starts at offset 0, so
        // the first line is complete and must not be dropped.
        let meta = parse_str("{\"type\":\"user\",\"message\":{\"content\":\"only\"}}\n")
            .await
            .unwrap();
        assert_eq!(meta.last_message_preview, "only");
    }

    #[tokio::test]
    async fn large_file_tail_drops_partial_first_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{{\"cwd\":\"/big\",\"version\":\"1.0.0\"}}").unwrap();
        // Push the interesting record past the 4 KiB tail boundary so the
        // window starts inside the filler line.
        let filler = format!("{{\"pad\":\"{}\"}}", "x".repeat(8192));
        writeln!(f, "{filler}").unwrap();
        writeln!(f, "{{\"type\":\"assistant\",\"message\":{{\"content\":\"tail\"}}}}").unwrap();
        drop(f);

        let meta = parse_session_file(&path, "s", "-p").await.unwrap().unwrap();
        assert_eq!(meta.project_path, "/big");
        assert_eq!(meta.last_message_preview, "tail");
        assert_eq!(meta.last_message_role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn header_scan_stops_after_twenty_lines() {
        let mut content = String::new();
        for i in 0..25 {
            content.push_str(&format!("{{\"n\":{i}}}\n"));
        }
        content.push_str("{\"cwd\":\"/late\"}\n");
        let meta = parse_str(&content).await.unwrap();
        // cwd appears on line 26, past the 20-line window, so the fallback wins.
        assert_eq!(meta.project_path, "/proj/a");
    }

    #[test]
    fn preview_truncates_at_200_chars() {
        let short = "a".repeat(200);
        assert_eq!(truncate_preview(&short), short);
        assert!(!truncate_preview(&short).ends_with("..."));

        let long = "b".repeat(201);
        let truncated = truncate_preview(&long);
        assert_eq!(truncated.chars().count(), 203);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn preview_counts_code_points_not_bytes() {
        let long: String = "é".repeat(250);
        let truncated = truncate_preview(&long);
        assert_eq!(truncated.chars().count(), 203);
    }

    #[test]
    fn preview_from_blocks_uses_first_text_block() {
        let content: MessageContent = serde_json::from_str(
            r#"[{"type":"tool_use","name":"Bash"},{"type":"text","text":"answer"},{"type":"text","text":"later"}]"#,
        )
        .unwrap();
        assert_eq!(extract_preview(&content), "answer");
    }

    #[test]
    fn preview_empty_when_no_text_block() {
        let content: MessageContent =
            serde_json::from_str(r#"[{"type":"tool_use","name":"Bash"}]"#).unwrap();
        assert_eq!(extract_preview(&content), "");
    }

    #[test]
    fn fallback_path_strips_leading_dash() {
        assert_eq!(fallback_project_path("-Users-x-app"), "/Users/x/app");
        assert_eq!(fallback_project_path("proj-a"), "/proj/a");
        assert_eq!(fallback_project_path(""), "");
    }
}
