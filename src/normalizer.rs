//! Provider dispatch - turns raw session logs into normalized sessions.
//!
//! Each provider arm is a pure `&str -> ParsedSession` function:
//! - claude: ~/.claude/projects/<project>/<session>.jsonl (branching)
//! - pi: ~/.pi/agent/sessions/<cwd-encoded>/<ts>_<uuid>.jsonl (branching)
//! - codex: ~/.codex/sessions/YYYY/MM/DD/rollout-<ts>-<uuid>.jsonl (linear)
//!
//! File access lives here so the parsers stay testable on strings.

use crate::error::{Result, SyncError};
use crate::sessions::{
    title_from_messages, ContextUsage, NormalizedMessage, Provider, Session, SessionSummary,
};
use crate::{claude, codex, pi};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Output of one provider parse
#[derive(Debug, Clone, Default)]
pub struct ParsedSession {
    pub messages: Vec<NormalizedMessage>,
    /// Provider-supplied title, if the log carries one
    pub title: Option<String>,
    pub context_usage: Option<ContextUsage>,
    /// Malformed lines dropped while parsing
    pub skipped_lines: usize,
}

impl ParsedSession {
    /// Project into a summary. `modified` stands in for missing timestamps.
    pub fn summary(
        &self,
        session_id: &str,
        project_id: &str,
        provider: Provider,
        modified: SystemTime,
    ) -> SessionSummary {
        let fallback = system_time_to_rfc3339(modified);
        let created_at = self
            .messages
            .iter()
            .map(|m| m.timestamp.as_str())
            .find(|t| !t.is_empty())
            .map_or_else(|| fallback.clone(), str::to_string);
        let updated_at = self
            .messages
            .iter()
            .rev()
            .map(|m| m.timestamp.as_str())
            .find(|t| !t.is_empty())
            .map_or(fallback, str::to_string);

        SessionSummary {
            id: session_id.to_string(),
            project_id: project_id.to_string(),
            provider,
            title: self
                .title
                .clone()
                .or_else(|| title_from_messages(&self.messages)),
            created_at,
            updated_at,
            message_count: self.messages.len(),
            context_usage: self.context_usage,
        }
    }
}

/// Deserialize one record per non-empty line, skipping lines that fail.
/// Returns the records and the number of skipped lines.
pub fn parse_lines<T: DeserializeOwned>(content: &str) -> (Vec<T>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                debug!("Skipping malformed line {}: {}", line_no + 1, e);
            }
        }
    }
    (records, skipped)
}

impl Provider {
    /// Whether the raw log is a tree (entries carry parent links).
    pub fn is_branching(self) -> bool {
        matches!(self, Provider::Claude | Provider::Pi)
    }

    /// Session id encoded in a log file name, or None if the file is not a session log.
    pub fn session_id_from_path(self, path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            return None;
        }
        let file_name = path.file_name()?.to_str()?;
        let stem = path.file_stem()?.to_str()?;
        match self {
            // Subagent transcripts live next to their parent session
            Provider::Claude if stem.starts_with("agent-") => None,
            Provider::Claude => Some(stem.to_string()),
            Provider::Codex => codex::extract_session_id(file_name),
            Provider::Pi => pi::extract_session_id(stem),
        }
    }

    /// Parse a whole log.
    pub fn parse(self, content: &str, session_id: &str) -> ParsedSession {
        match self {
            Provider::Claude => claude::parse_claude_session(content),
            Provider::Codex => codex::parse_codex_session(content, session_id),
            Provider::Pi => pi::parse_pi_session(content, session_id),
        }
    }

    /// Find the log file for `session_id` inside `dir`.
    pub async fn locate(self, dir: &Path, session_id: &str) -> Option<PathBuf> {
        if self == Provider::Claude {
            let direct = dir.join(format!("{}.jsonl", session_id));
            if tokio::fs::metadata(&direct).await.is_ok() {
                return Some(direct);
            }
        }

        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if self.session_id_from_path(&path).as_deref() == Some(session_id) {
                return Some(path);
            }
        }
        None
    }
}

/// Read and normalize one session.
///
/// With `since`, only messages after that id are returned; the summary always
/// describes the whole session. An unknown `since` id returns every message.
pub async fn get_session(
    dir: &Path,
    project_id: &str,
    provider: Provider,
    session_id: &str,
    since: Option<&str>,
) -> Result<Session> {
    let path = provider
        .locate(dir, session_id)
        .await
        .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;

    let log = match read_log(&path).await {
        Ok(log) => log,
        // Deleted between locate and read
        Err(e) if e.is_not_found() => return Err(SyncError::SessionNotFound(session_id.to_string())),
        Err(e) => return Err(e),
    };

    let mut parsed = provider.parse(&log.content, session_id);
    parsed.skipped_lines += log.invalid_lines;
    if parsed.skipped_lines > 0 {
        debug!(
            "Skipped {} malformed lines in {} session {}",
            parsed.skipped_lines, provider, session_id
        );
    }
    let summary = parsed.summary(session_id, project_id, provider, log.modified);

    let mut messages = parsed.messages;
    if let Some(cursor) = since {
        match messages
            .iter()
            .position(|m| m.canonical_id() == cursor || m.uuid == cursor)
        {
            Some(pos) => {
                messages.drain(..=pos);
            }
            None => debug!("Cursor {} not found in {}, returning full session", cursor, session_id),
        }
    }

    Ok(Session { summary, messages })
}

/// A session log as read from disk
#[derive(Debug, Clone)]
pub struct RawLog {
    /// Valid UTF-8 lines, newline-joined
    pub content: String,
    pub modified: SystemTime,
    /// Bytes read, comparable with the file length
    pub len: u64,
    /// Lines dropped because they were not valid UTF-8
    pub invalid_lines: usize,
}

/// Read a log file along with its modification time.
///
/// A torn write or binary paste only costs the lines it touches.
pub async fn read_log(path: &Path) -> Result<RawLog> {
    let metadata = tokio::fs::metadata(path).await?;
    let modified = metadata.modified()?;
    let bytes = tokio::fs::read(path).await?;
    let (content, invalid_lines) = decode_lines(&bytes);
    if invalid_lines > 0 {
        debug!("Dropped {} non-UTF-8 lines from {}", invalid_lines, path.display());
    }
    Ok(RawLog {
        content,
        modified,
        len: bytes.len() as u64,
        invalid_lines,
    })
}

/// Keep the lines that decode as UTF-8. Returns the text and the number dropped.
pub fn decode_lines(bytes: &[u8]) -> (String, usize) {
    let mut content = String::with_capacity(bytes.len());
    let mut invalid = 0;
    for (line_no, line) in bytes.split(|b| *b == b'\n').enumerate() {
        match std::str::from_utf8(line) {
            Ok(text) => {
                content.push_str(text);
                content.push('\n');
            }
            Err(e) => {
                invalid += 1;
                debug!("Skipping undecodable line {}: {}", line_no + 1, e);
            }
        }
    }
    (content, invalid)
}

pub fn system_time_to_rfc3339(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
