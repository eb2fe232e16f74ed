//! Parse Claude Code sessions from ~/.claude/projects/
//!
//! Claude stores one JSONL file per session:
//! ~/.claude/projects/{project_id}/{session_id}.jsonl
//!
//! Every conversational record carries `uuid` and `parentUuid`, so the file
//! is a tree: rewinding and resending leaves a dead branch, parallel tool
//! calls fork. After a compaction the boundary record has a null
//! `parentUuid` and links back through `logicalParentUuid`.
//!
//! Record types:
//! - user, assistant: Messages
//! - system: compact_boundary markers (other subtypes skipped)
//! - summary: Session title
//! - progress, file-history-snapshot, queue-operation: DAG links only

use crate::dag::{self, DagEntry, DagNode};
use crate::normalizer::{parse_lines, ParsedSession};
use crate::sessions::{
    blocks_from_content, ContentBlock, ContextUsage, NormalizedMessage, TokenUsage, COMPACT_BOUNDARY,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Context window assumed for Claude models
pub const CONTEXT_WINDOW: u64 = 200_000;

/// Claude JSONL record (only the fields reconciliation needs)
#[derive(Debug, Deserialize)]
pub struct ClaudeEntry {
    #[serde(rename = "type", default)]
    pub record_type: String,
    pub uuid: Option<String>,
    #[serde(rename = "parentUuid")]
    pub parent_uuid: Option<String>,
    #[serde(rename = "logicalParentUuid")]
    pub logical_parent_uuid: Option<String>,
    pub timestamp: Option<String>,
    pub subtype: Option<String>,
    pub message: Option<Value>,
    /// System records carry plain-text content at the top level
    pub content: Option<Value>,
    pub summary: Option<String>,
    #[serde(rename = "isSidechain", default)]
    pub is_sidechain: bool,
    #[serde(rename = "isCompactSummary", default)]
    pub is_compact_summary: bool,
    #[serde(rename = "isVisibleInTranscriptOnly", default)]
    pub is_visible_in_transcript_only: bool,
}

impl ClaudeEntry {
    fn content_items(&self) -> impl Iterator<Item = &Value> {
        self.message
            .as_ref()
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .into_iter()
            .flatten()
    }

    fn items_of_type<'a>(&'a self, kind: &'static str, field: &'static str) -> Vec<&'a str> {
        self.content_items()
            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some(kind))
            .filter_map(|item| item.get(field).and_then(|v| v.as_str()))
            .collect()
    }

    /// Hidden from the transcript but still part of the tree.
    fn is_hidden(&self) -> bool {
        self.is_sidechain || self.is_compact_summary || self.is_visible_in_transcript_only
    }
}

impl DagEntry for ClaudeEntry {
    fn id(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_uuid
            .as_deref()
            .or(self.logical_parent_uuid.as_deref())
    }

    fn tool_use_ids(&self) -> Vec<&str> {
        self.items_of_type("tool_use", "id")
    }

    fn tool_result_ids(&self) -> Vec<&str> {
        self.items_of_type("tool_result", "tool_use_id")
    }

    fn has_content(&self) -> bool {
        !self.is_sidechain && matches!(self.record_type.as_str(), "user" | "assistant" | "system")
    }
}

/// Parse a Claude session log into the active transcript.
pub fn parse_claude_session(content: &str) -> ParsedSession {
    let (entries, skipped_lines) = parse_lines::<ClaudeEntry>(content);

    let title = entries
        .iter()
        .rev()
        .filter(|e| e.record_type == "summary")
        .find_map(|e| e.summary.clone());

    let resolved = dag::resolve(&entries);
    let mut messages: Vec<NormalizedMessage> = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();

    for node in &resolved.active {
        let side = resolved.attached_to(&node.id);
        for n in std::iter::once(node).chain(side) {
            let Some(mut msg) = to_message(n, &resolved.orphaned_tool_use_ids) else {
                continue;
            };
            msg.parent_uuid = resolved.nearest_ancestor(&n.id, |id| emitted.contains(id));
            emitted.insert(msg.uuid.clone());
            messages.push(msg);
        }
    }

    let context_usage = messages
        .iter()
        .rev()
        .find_map(|m| m.usage)
        .map(|u| ContextUsage::new(u.context_tokens(), CONTEXT_WINDOW));

    debug!(
        "Claude session: {} entries, {} messages, {} sibling results, {} sibling branches",
        entries.len(),
        messages.len(),
        resolved.sibling_tool_results.len(),
        resolved.sibling_tool_branches.len()
    );

    ParsedSession {
        messages,
        title,
        context_usage,
        skipped_lines,
    }
}

fn to_message(node: &DagNode<'_, ClaudeEntry>, orphaned: &HashSet<String>) -> Option<NormalizedMessage> {
    let entry = node.entry;
    if entry.is_hidden() {
        return None;
    }
    let timestamp = entry.timestamp.clone().unwrap_or_default();

    match entry.record_type.as_str() {
        "system" if entry.subtype.as_deref() == Some(COMPACT_BOUNDARY) => {
            let text = entry
                .content
                .as_ref()
                .and_then(|c| c.as_str())
                .unwrap_or("Conversation compacted");
            Some(NormalizedMessage::compact_boundary(node.id.clone(), timestamp, text))
        }
        "user" | "assistant" => {
            let message = entry.message.as_ref()?;
            let content = extract_content_blocks(message);
            if content.is_empty() {
                return None;
            }
            let role = message
                .get("role")
                .and_then(|r| r.as_str())
                .unwrap_or(&entry.record_type)
                .to_string();

            let mut msg = NormalizedMessage::new(node.id.clone(), role, timestamp).with_content(content);
            msg.orphaned_tool_use_ids = msg
                .tool_use_ids()
                .filter(|id| orphaned.contains(*id))
                .map(str::to_string)
                .collect();
            msg.usage = message.get("usage").and_then(extract_usage);
            Some(msg)
        }
        _ => None,
    }
}

fn extract_usage(usage: &Value) -> Option<TokenUsage> {
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    let input_tokens = usage.get("input_tokens")?.as_u64()?;
    Some(TokenUsage {
        input_tokens,
        output_tokens: field("output_tokens"),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_write_tokens: field("cache_creation_input_tokens"),
    })
}

/// Extract content blocks from a Claude `message` object
pub fn extract_content_blocks(message: &Value) -> Vec<ContentBlock> {
    message.get("content").map_or_else(Vec::new, blocks_from_content)
}
