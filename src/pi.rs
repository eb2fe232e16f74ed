//! Parse Pi coding agent sessions from ~/.pi/agent/sessions/
//!
//! Pi stores sessions in a tree-structured JSONL format:
//! ~/.pi/agent/sessions/<cwd-encoded>/<timestamp>_<uuid>.jsonl
//!
//! File format:
//! - Line 1: SessionHeader {type: "session", id, timestamp, cwd}
//! - Lines 2+: SessionEntry {type, id, parentId, timestamp, ...}
//!
//! Entry types:
//! - "message": Contains AgentMessage (user, assistant, toolResult, bashExecution, custom, etc.)
//! - "compaction": Context compaction (becomes a boundary marker)
//! - "session_info": Session name (title)
//! - "thinking_level_change", "model_change", "branch_summary", "custom",
//!   "custom_message", "label": Metadata (tree links only)
//!
//! Tree structure: entries link via id/parentId and are resolved with the
//! same branch resolver Claude sessions use.

use crate::dag::{self, DagEntry};
use crate::normalizer::{parse_lines, ParsedSession};
use crate::sessions::{blocks_from_content, ContentBlock, ContextUsage, NormalizedMessage, TokenUsage};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Context window assumed when Pi does not report one
pub const CONTEXT_WINDOW: u64 = 200_000;

/// Pi JSONL line: either a session header or a session entry
#[derive(Debug, Deserialize)]
struct PiRecord {
    #[serde(rename = "type")]
    record_type: String,
    /// Entry ID (also the session ID on the header)
    id: Option<String>,
    /// Parent entry ID (null for root entries)
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
    /// Timestamp (ISO 8601 on header, ISO or unix on entries)
    timestamp: Option<Value>,
    /// The message payload (message entries only)
    message: Option<Value>,
    /// Session name (session_info entries)
    name: Option<String>,
    /// Compaction summary text (compaction entries)
    summary: Option<String>,
}

impl PiRecord {
    fn is_header(&self) -> bool {
        self.record_type == "session"
    }

    fn role(&self) -> Option<&str> {
        self.message.as_ref()?.get("role")?.as_str()
    }
}

impl DagEntry for PiRecord {
    fn id(&self) -> Option<&str> {
        if self.is_header() {
            return None;
        }
        self.id.as_deref()
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn tool_use_ids(&self) -> Vec<&str> {
        if self.role() != Some("assistant") {
            return Vec::new();
        }
        self.message
            .as_ref()
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .into_iter()
            .flatten()
            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("toolCall"))
            .filter_map(|item| item.get("id").and_then(|v| v.as_str()))
            .collect()
    }

    fn tool_result_ids(&self) -> Vec<&str> {
        if self.role() != Some("toolResult") {
            return Vec::new();
        }
        self.message
            .as_ref()
            .and_then(|m| m.get("toolCallId"))
            .and_then(|v| v.as_str())
            .into_iter()
            .collect()
    }

    fn has_content(&self) -> bool {
        matches!(self.record_type.as_str(), "message" | "compaction")
    }
}

/// Extract session UUID from a session file stem
/// e.g. "1738000000000_abc12345-..." → "abc12345-..."
/// or just "abc12345-..." if no timestamp prefix
pub fn extract_session_id(stem: &str) -> Option<String> {
    if let Some((_ts, uuid)) = stem.split_once('_') {
        if !uuid.is_empty() {
            return Some(uuid.to_string());
        }
    }
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

/// Generate deterministic UUID for Pi entries
fn generate_uuid(session_id: &str, entry_id: &str) -> String {
    format!("pi-{}-{}", session_id, entry_id)
}

/// Extract timestamp as ISO 8601 string from a serde_json::Value
/// Pi uses unix timestamps (numbers) in messages, ISO strings in headers
fn extract_timestamp(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            // Unix timestamp in milliseconds
            if let Some(ms) = n.as_f64() {
                let secs = (ms / 1000.0) as i64;
                let nanos = ((ms % 1000.0) * 1_000_000.0) as u32;
                if let Some(dt) = chrono::DateTime::from_timestamp(secs, nanos) {
                    return dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

/// Parse a Pi session log into the active transcript
pub fn parse_pi_session(content: &str, session_id: &str) -> ParsedSession {
    let (records, skipped_lines) = parse_lines::<PiRecord>(content);

    let title = records
        .iter()
        .rev()
        .filter(|r| r.record_type == "session_info")
        .find_map(|r| r.name.clone());

    let resolved = dag::resolve(&records);
    let mut messages: Vec<NormalizedMessage> = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut last_usage: Option<TokenUsage> = None;

    for node in &resolved.active {
        let side = resolved.attached_to(&node.id);
        for n in std::iter::once(node).chain(side) {
            let entry = n.entry;
            let timestamp = entry
                .timestamp
                .as_ref()
                .map(extract_timestamp)
                .or_else(|| {
                    entry
                        .message
                        .as_ref()
                        .and_then(|m| m.get("timestamp"))
                        .map(extract_timestamp)
                })
                .unwrap_or_default();
            let uuid = generate_uuid(session_id, &n.id);

            let msg = match entry.record_type.as_str() {
                "compaction" => Some(NormalizedMessage::compact_boundary(
                    uuid,
                    timestamp,
                    entry.summary.as_deref().unwrap_or("Conversation compacted"),
                )),
                "message" => entry
                    .message
                    .as_ref()
                    .and_then(|m| message_to_normalized(m, uuid, timestamp)),
                _ => None,
            };
            let Some(mut msg) = msg else {
                continue;
            };
            // Pi's own entry id is what a live bridge reports
            msg.message_id = Some(n.id.clone());

            msg.orphaned_tool_use_ids = msg
                .tool_use_ids()
                .filter(|id| resolved.orphaned_tool_use_ids.contains(*id))
                .map(str::to_string)
                .collect();
            msg.parent_uuid = resolved
                .nearest_ancestor(&n.id, |id| emitted.contains(id))
                .map(|id| generate_uuid(session_id, &id));
            if msg.usage.is_some() {
                last_usage = msg.usage;
            }
            emitted.insert(n.id.clone());
            messages.push(msg);
        }
    }

    ParsedSession {
        messages,
        title,
        context_usage: last_usage.map(|u| ContextUsage::new(u.context_tokens(), CONTEXT_WINDOW)),
        skipped_lines,
    }
}

fn message_to_normalized(msg: &Value, uuid: String, timestamp: String) -> Option<NormalizedMessage> {
    let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");

    let (role, blocks) = match role {
        "user" | "assistant" => {
            let blocks: Vec<ContentBlock> = msg
                .get("content")
                .map_or_else(Vec::new, blocks_from_content)
                .into_iter()
                .map(canonical_tool_use)
                .collect();
            (role, blocks)
        }
        // Tool results are user messages in normalized format
        "toolResult" => (
            "user",
            vec![ContentBlock::ToolResult {
                tool_use_id: msg
                    .get("toolCallId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                content: msg.get("content").cloned().unwrap_or(Value::Null),
                is_error: msg.get("isError").and_then(|v| v.as_bool()),
                structured: None,
            }],
        ),
        // User-run `!command`, shown the way a terminal would
        "bashExecution" => {
            let command = msg.get("command").and_then(|v| v.as_str()).unwrap_or("");
            let output = msg.get("output").and_then(|v| v.as_str()).unwrap_or("");
            let text = match msg.get("exitCode").and_then(|v| v.as_i64()) {
                Some(code) => format!("$ {}\n{}\n[exit code: {}]", command, output, code),
                None => format!("$ {}\n{}", command, output),
            };
            ("user", vec![ContentBlock::Text { text }])
        }
        other => {
            debug!("Skipping Pi message role: {}", other);
            return None;
        }
    };
    if blocks.is_empty() {
        return None;
    }

    let mut normalized = NormalizedMessage::new(uuid, role, timestamp).with_content(blocks);
    if role == "assistant" {
        normalized.usage = msg.get("usage").and_then(extract_usage);
    }
    Some(normalized)
}

fn extract_usage(usage: &Value) -> Option<TokenUsage> {
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    Some(TokenUsage {
        input_tokens: usage.get("input")?.as_u64()?,
        output_tokens: field("output"),
        cache_read_tokens: field("cacheRead"),
        cache_write_tokens: field("cacheWrite"),
    })
}

fn canonical_tool_use(block: ContentBlock) -> ContentBlock {
    match block {
        ContentBlock::ToolUse { id, name, input } => {
            let (name, input) = normalize_pi_tool(&name, input);
            ContentBlock::ToolUse { id, name, input }
        }
        other => other,
    }
}

/// Normalize Pi tool names and argument field names to match Claude CLI conventions.
/// Pi uses lowercase names (bash, read, write, edit) and different field names
/// (path vs file_path, oldText/newText vs old_string/new_string).
fn normalize_pi_tool(name: &str, mut args: Value) -> (String, Value) {
    let normalized_name = match name {
        "bash" => "Bash",
        "read" => "Read",
        "write" => "Write",
        "edit" => "Edit",
        "grep" => "Grep",
        "glob" => "Glob",
        other => {
            // Capitalize first letter for unknown tools
            let mut s = other.to_string();
            if let Some(c) = s.get_mut(0..1) {
                c.make_ascii_uppercase();
            }
            return (s, args);
        }
    };

    if let Some(obj) = args.as_object_mut() {
        let renames: &[(&str, &str)] = match name {
            "read" | "write" => &[("path", "file_path")],
            "edit" => &[
                ("path", "file_path"),
                ("oldText", "old_string"),
                ("newText", "new_string"),
            ],
            _ => &[],
        };
        for (from, to) in renames {
            if let Some(v) = obj.remove(*from) {
                obj.insert(to.to_string(), v);
            }
        }
    }

    (normalized_name.to_string(), args)
}
