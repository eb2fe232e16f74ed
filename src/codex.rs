//! Parse Codex sessions from ~/.codex/sessions/
//!
//! Codex stores sessions in:
//! ~/.codex/sessions/YYYY/MM/DD/rollout-{timestamp}-{uuid}.jsonl
//!
//! The log is linear: file order is the conversation order.
//!
//! Record types:
//! - session_meta: Session metadata (skipped, the id comes from the filename)
//! - response_item: Messages, tool calls and outputs, reasoning
//! - compacted: Context compaction (becomes a boundary marker)
//! - event_msg: token_count feeds context usage, the rest is skipped
//! - turn_context: Skipped

use crate::normalizer::{parse_lines, ParsedSession};
use crate::sessions::{ContentBlock, ContextUsage, ImageSource, NormalizedMessage, TokenUsage};
use crate::shell::{self, ShellIntent};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Fallback when token_count does not report the model's window
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Tool names Codex uses for running a shell command
const SHELL_TOOLS: &[&str] = &[
    "shell",
    "shell_command",
    "exec_command",
    "container.exec",
    "local_shell",
];

/// Non-shell tool names mapped onto the canonical vocabulary
const TOOL_ALIASES: &[(&str, &str)] = &[("web_search", "WebSearch")];

/// User turns Codex injects itself
const INJECTED_PREFIXES: &[&str] = &[
    "<environment_context>",
    "<user_instructions>",
    "# AGENTS.md instructions",
];

/// Codex JSONL record envelope
#[derive(Debug, Deserialize)]
struct CodexRecord {
    #[serde(default)]
    timestamp: String,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    payload: Value,
}

/// What we remember about a tool call until its output arrives
#[derive(Debug, Clone)]
struct ToolCallState {
    uuid: String,
    /// Canonical tool name
    name: String,
    input: Value,
    intent: ShellIntent,
}

impl ToolCallState {
    /// Ran through a shell, whatever it was reclassified as.
    fn is_shell(&self) -> bool {
        self.name == "Bash" || !matches!(self.intent, ShellIntent::Other)
    }

    /// Result block for this call's raw output.
    fn result_block(&self, call_id: &str, raw: &Value) -> ContentBlock {
        let output = shell::parse_tool_output(raw, self.is_shell());
        let structured = match &self.intent {
            ShellIntent::Read(read) if !output.is_error => Some(shell::read_result(read, &output.body)),
            // grep and rg exit 1 when nothing matched
            ShellIntent::Grep(grep) if output.exit_code.map_or(!output.is_error, |code| code <= 1) => {
                Some(shell::grep_result(grep, &output.body))
            }
            _ => None,
        };
        if output.is_error {
            debug!("{} call {} failed ({:?})", self.name, call_id, self.input.get("command"));
        }
        ContentBlock::ToolResult {
            tool_use_id: call_id.to_string(),
            content: Value::String(output.body),
            is_error: Some(output.is_error),
            structured,
        }
    }
}

/// Extract session UUID from Codex filename
/// "rollout-2026-02-03T02-32-13-019c2157-e0e9-7bb2-a886-d3b1a9e24d4f.jsonl"
/// -> "019c2157-e0e9-7bb2-a886-d3b1a9e24d4f"
pub fn extract_session_id(filename: &str) -> Option<String> {
    let name = filename.strip_suffix(".jsonl")?;

    // UUID format is 8-4-4-4-12: the last 5 dash-separated segments
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() < 6 {
        return None;
    }
    Some(parts[parts.len() - 5..].join("-"))
}

/// Generate deterministic UUID for Codex records (they don't have per-message UUIDs)
pub fn generate_uuid(session_id: &str, timestamp: &str, index: usize) -> String {
    format!("codex-{}-{}-{}", session_id, index, timestamp.replace([':', '.', '-'], ""))
}

/// Map a Codex tool call onto the canonical tool vocabulary.
/// Shell reads and searches are reclassified as Read / Grep.
fn canonicalize_tool(name: &str, input: Value) -> (String, Value, ShellIntent) {
    if SHELL_TOOLS.contains(&name) {
        let Some(command) = shell::command_from_input(&input) else {
            return ("Bash".to_string(), input, ShellIntent::Other);
        };
        let intent = shell::classify(&command);
        let (name, args) = match &intent {
            ShellIntent::Read(read) => {
                let mut args = json!({ "file_path": read.file_path });
                if let Some(offset) = read.offset {
                    args["offset"] = json!(offset);
                }
                if let Some(limit) = read.limit {
                    args["limit"] = json!(limit);
                }
                ("Read", args)
            }
            ShellIntent::Grep(grep) => {
                let output_mode = if grep.files_only { "files_with_matches" } else { "content" };
                let mut args = json!({ "pattern": grep.pattern, "output_mode": output_mode });
                if let Some(path) = &grep.path {
                    args["path"] = json!(path);
                }
                if let Some(glob) = &grep.glob {
                    args["glob"] = json!(glob);
                }
                if grep.case_insensitive {
                    args["-i"] = json!(true);
                }
                ("Grep", args)
            }
            ShellIntent::Other => {
                let mut args = json!({ "command": command });
                if let Some(workdir) = input.get("workdir").or_else(|| input.get("working_directory")) {
                    args["workdir"] = workdir.clone();
                }
                ("Bash", args)
            }
        };
        return (name.to_string(), args, intent);
    }

    let canonical = TOOL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| name.to_string());
    (canonical, input, ShellIntent::Other)
}

/// Tool call arguments: JSON-in-a-string for function calls, raw text for custom tools
fn parse_arguments(payload: &Value) -> Value {
    if let Some(args) = payload.get("arguments").and_then(|v| v.as_str()) {
        return serde_json::from_str(args).unwrap_or_else(|_| json!({ "input": args }));
    }
    match payload.get("input") {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({ "input": s })),
        Some(other) => other.clone(),
        None => json!({}),
    }
}

/// Parse a Codex JSONL log into normalized messages
pub fn parse_codex_session(content: &str, session_id: &str) -> ParsedSession {
    let (records, skipped_lines) = parse_lines::<CodexRecord>(content);

    let mut messages: Vec<NormalizedMessage> = Vec::new();
    let mut msg_index = 0usize;
    let mut tool_calls: HashMap<String, ToolCallState> = HashMap::new();
    let mut answered: HashSet<String> = HashSet::new();
    let mut context_usage = None;

    let mut next_uuid = |timestamp: &str| {
        let uuid = generate_uuid(session_id, timestamp, msg_index);
        msg_index += 1;
        uuid
    };

    for record in &records {
        let payload = &record.payload;
        let ts = record.timestamp.as_str();

        match record.record_type.as_str() {
            "response_item" => {
                let item_type = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match item_type {
                    "message" => {
                        let role = payload.get("role").and_then(|v| v.as_str()).unwrap_or("user");

                        // Skip developer/system messages (internal prompts)
                        if role == "developer" || role == "system" {
                            continue;
                        }

                        let Some(content_arr) = payload.get("content").and_then(|v| v.as_array()) else {
                            continue;
                        };
                        let blocks = extract_content_blocks(content_arr);
                        if blocks.is_empty() || (role == "user" && is_injected(&blocks)) {
                            continue;
                        }

                        messages.push(
                            NormalizedMessage::new(next_uuid(ts), role, ts).with_content(blocks),
                        );
                    }
                    "function_call" | "custom_tool_call" | "local_shell_call" => {
                        let call_id = payload
                            .get("call_id")
                            .or_else(|| payload.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let (raw_name, input) = if item_type == "local_shell_call" {
                            ("local_shell", payload.get("action").cloned().unwrap_or(Value::Null))
                        } else {
                            (
                                payload.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                                parse_arguments(payload),
                            )
                        };

                        let (name, input, intent) = canonicalize_tool(raw_name, input);
                        let uuid = next_uuid(ts);
                        tool_calls.insert(
                            call_id.clone(),
                            ToolCallState {
                                uuid: uuid.clone(),
                                name: name.clone(),
                                input: input.clone(),
                                intent,
                            },
                        );

                        messages.push(NormalizedMessage::new(uuid, "assistant", ts).with_content(vec![
                            ContentBlock::ToolUse { id: call_id, name, input },
                        ]));
                    }
                    "function_call_output" | "custom_tool_call_output" => {
                        let call_id = payload.get("call_id").and_then(|v| v.as_str()).unwrap_or("");
                        let raw = payload.get("output").cloned().unwrap_or(Value::Null);
                        let block = match tool_calls.get(call_id) {
                            Some(call) => call.result_block(call_id, &raw),
                            None => {
                                // Output for a call we never saw: assume a shell
                                let output = shell::parse_output(&raw);
                                ContentBlock::ToolResult {
                                    tool_use_id: call_id.to_string(),
                                    content: Value::String(output.body),
                                    is_error: Some(output.is_error),
                                    structured: None,
                                }
                            }
                        };
                        answered.insert(call_id.to_string());

                        // Tool results are user messages in Claude format
                        messages.push(
                            NormalizedMessage::new(next_uuid(ts), "user", ts).with_content(vec![block]),
                        );
                    }
                    "reasoning" => {
                        // Only the summary is readable (content is encrypted)
                        let Some(summary) = payload.get("summary").and_then(|v| v.as_array()) else {
                            continue;
                        };
                        let thinking: String = summary
                            .iter()
                            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n");
                        if !thinking.is_empty() {
                            messages.push(
                                NormalizedMessage::new(next_uuid(ts), "assistant", ts)
                                    .with_content(vec![ContentBlock::Thinking { thinking }]),
                            );
                        }
                    }
                    "web_search_call" => {
                        let uuid = next_uuid(ts);
                        let call_id = payload
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{uuid}-search"));
                        let query = payload
                            .get("action")
                            .and_then(|a| a.get("query"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let (name, input, _) = canonicalize_tool("web_search", json!({ "query": query }));
                        // Searches never get an output record
                        answered.insert(call_id.clone());

                        messages.push(NormalizedMessage::new(uuid, "assistant", ts).with_content(vec![
                            ContentBlock::ToolUse { id: call_id, name, input },
                        ]));
                    }
                    _ => {
                        debug!("Skipping Codex response_item type: {}", item_type);
                    }
                }
            }
            "compacted" => {
                let text = payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("Conversation compacted");
                messages.push(NormalizedMessage::compact_boundary(next_uuid(ts), ts, text));
            }
            "event_msg" => {
                if payload.get("type").and_then(|v| v.as_str()) == Some("token_count") {
                    if let Some(usage) = token_count_usage(payload) {
                        context_usage = Some(usage);
                    }
                }
            }
            "session_meta" | "turn_context" => {}
            _ => {
                debug!("Skipping Codex record type: {}", record.record_type);
            }
        }
    }

    // Calls with no output anywhere in the log are orphaned.
    let orphaned: HashMap<&str, &str> = tool_calls
        .iter()
        .filter(|(call_id, _)| !answered.contains(*call_id))
        .map(|(call_id, state)| (state.uuid.as_str(), call_id.as_str()))
        .collect();
    for msg in &mut messages {
        if let Some(call_id) = orphaned.get(msg.uuid.as_str()) {
            msg.orphaned_tool_use_ids = vec![call_id.to_string()];
        }
    }

    ParsedSession {
        messages,
        title: None,
        context_usage,
        skipped_lines,
    }
}

/// `event_msg` / `token_count`: last turn's input is what occupies the window
fn token_count_usage(payload: &Value) -> Option<ContextUsage> {
    let info = payload.get("info")?;
    let last = info.get("last_token_usage")?;
    let usage = TokenUsage {
        input_tokens: last.get("input_tokens")?.as_u64()?,
        output_tokens: last.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        ..Default::default()
    };
    let window = info
        .get("model_context_window")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_CONTEXT_WINDOW);
    Some(ContextUsage::new(usage.context_tokens(), window))
}

fn is_injected(blocks: &[ContentBlock]) -> bool {
    blocks.iter().all(|b| match b {
        ContentBlock::Text { text } => {
            let text = text.trim_start();
            INJECTED_PREFIXES.iter().any(|p| text.starts_with(p))
        }
        _ => false,
    })
}

/// Extract content blocks from Codex content array
fn extract_content_blocks(content: &[Value]) -> Vec<ContentBlock> {
    content
        .iter()
        .filter_map(|item| {
            let block_type = item.get("type").and_then(|v| v.as_str())?;

            match block_type {
                "input_text" | "output_text" | "text" => {
                    let text = item.get("text").and_then(|v| v.as_str())?.to_string();
                    if text.is_empty() {
                        return None;
                    }
                    Some(ContentBlock::Text { text })
                }
                "input_image" => {
                    // data:<media type>;base64,<data>
                    let url = item.get("image_url").and_then(|v| v.as_str())?;
                    let source = url.strip_prefix("data:").and_then(|rest| {
                        let (media_type, data) = rest.split_once(";base64,")?;
                        Some(ImageSource {
                            source_type: "base64".to_string(),
                            media_type: media_type.to_string(),
                            data: data.to_string(),
                        })
                    });
                    Some(ContentBlock::Image { source })
                }
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::StructuredResult;

    fn record(record_type: &str, payload: Value) -> String {
        serde_json::to_string(&json!({
            "timestamp": "2026-02-03T10:30:00.000Z",
            "type": record_type,
            "payload": payload,
        }))
        .unwrap()
    }

    fn tool_use(msg: &NormalizedMessage) -> (&str, &str, &Value) {
        match &msg.content[0] {
            ContentBlock::ToolUse { id, name, input } => (id.as_str(), name.as_str(), input),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_session_id() {
        assert_eq!(
            extract_session_id("rollout-2026-02-03T02-32-13-019c2157-e0e9-7bb2-a886-d3b1a9e24d4f.jsonl"),
            Some("019c2157-e0e9-7bb2-a886-d3b1a9e24d4f".to_string())
        );
        assert_eq!(extract_session_id("notes.txt"), None);
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid("abc123", "2026-02-03T10:30:00Z", 5);
        assert!(uuid.starts_with("codex-abc123-5-"));
    }

    #[test]
    fn shell_read_is_reclassified_and_result_rebuilt() {
        let log = [
            record("response_item", json!({
                "type": "function_call", "name": "shell", "call_id": "call_1",
                "arguments": "{\"command\":[\"bash\",\"-lc\",\"nl -ba src/lib.rs | sed -n '1,2p'\"]}"
            })),
            record("response_item", json!({
                "type": "function_call_output", "call_id": "call_1",
                "output": "Exit code: 0\nWall time: 0.1 seconds\nOutput:\n     1\tmod a;\n     2\tmod b;\n"
            })),
        ]
        .join("\n");
        let parsed = parse_codex_session(&log, "s1");
        assert_eq!(parsed.messages.len(), 2);

        let (id, name, input) = tool_use(&parsed.messages[0]);
        assert_eq!((id, name), ("call_1", "Read"));
        assert_eq!(input["file_path"], "src/lib.rs");
        assert_eq!(input["limit"], 2);

        match &parsed.messages[1].content[0] {
            ContentBlock::ToolResult { tool_use_id, is_error, structured, .. } => {
                assert_eq!(tool_use_id, "call_1");
                assert_eq!(*is_error, Some(false));
                assert_eq!(
                    structured.as_ref(),
                    Some(&StructuredResult::File {
                        file_path: "src/lib.rs".into(),
                        content: "mod a;\nmod b;".into(),
                        start_line: 1,
                        num_lines: 2,
                    })
                );
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[test]
    fn outputs_match_calls_that_are_not_adjacent() {
        let log = [
            record("response_item", json!({
                "type": "function_call", "name": "exec_command", "call_id": "a",
                "arguments": "{\"cmd\":\"rg -n todo src\"}"
            })),
            record("response_item", json!({
                "type": "function_call", "name": "shell_command", "call_id": "b",
                "arguments": "{\"command\":\"cargo build\"}"
            })),
            record("response_item", json!({
                "type": "function_call_output", "call_id": "b",
                "output": "Process exited with code 101\nOutput:\nerror[E0308]: mismatched types"
            })),
            record("response_item", json!({
                "type": "function_call_output", "call_id": "a",
                "output": "Process exited with code 0\nOutput:\nsrc/a.rs:3:// todo\n"
            })),
        ]
        .join("\n");
        let parsed = parse_codex_session(&log, "s1");
        assert_eq!(tool_use(&parsed.messages[0]).1, "Grep");
        assert_eq!(tool_use(&parsed.messages[1]).1, "Bash");
        assert_eq!(tool_use(&parsed.messages[1]).2["command"], "cargo build");

        let ContentBlock::ToolResult { is_error, structured, .. } = &parsed.messages[2].content[0] else {
            panic!("expected tool_result");
        };
        assert_eq!(*is_error, Some(true));
        assert!(structured.is_none());

        let ContentBlock::ToolResult { structured, .. } = &parsed.messages[3].content[0] else {
            panic!("expected tool_result");
        };
        assert!(matches!(structured, Some(StructuredResult::Matches { num_matches: 1, .. })));
    }

    #[test]
    fn unanswered_call_is_orphaned_and_order_is_file_order() {
        let log = [
            record("response_item", json!({
                "type": "message", "role": "user",
                "content": [{"type": "input_text", "text": "<environment_context>cwd</environment_context>"}]
            })),
            record("response_item", json!({
                "type": "message", "role": "user",
                "content": [{"type": "input_text", "text": "fix it"}]
            })),
            record("response_item", json!({
                "type": "function_call", "name": "shell", "call_id": "c1",
                "arguments": "{\"command\":[\"bash\",\"-lc\",\"make\"]}"
            })),
        ]
        .join("\n");
        let parsed = parse_codex_session(&log, "s1");
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[0].text(), "fix it");
        assert_eq!(parsed.messages[1].orphaned_tool_use_ids, vec!["c1"]);
    }

    #[test]
    fn non_shell_calls_keep_name_and_input_for_their_result() {
        let log = [
            record("response_item", json!({
                "type": "custom_tool_call", "name": "apply_patch", "call_id": "p1",
                "input": "*** Begin Patch\n*** Update File: src/lib.rs\n*** End Patch"
            })),
            record("response_item", json!({
                "type": "custom_tool_call_output", "call_id": "p1",
                "output": "Success. Updated the following files:\nM src/lib.rs\nerror: handling moved to mod.rs"
            })),
            record("response_item", json!({
                "type": "function_call", "name": "shell", "call_id": "r1",
                "arguments": "{\"command\":[\"bash\",\"-lc\",\"cat missing.rs\"]}"
            })),
            record("response_item", json!({
                "type": "function_call_output", "call_id": "r1",
                "output": "Exit code: 1\nOutput:\ncat: missing.rs: No such file or directory"
            })),
        ]
        .join("\n");
        let (records, _) = parse_lines::<CodexRecord>(&log);
        let raw_input = records[0].payload["input"].clone();
        let parsed = parse_codex_session(&log, "s1");

        let (id, name, input) = tool_use(&parsed.messages[0]);
        assert_eq!((id, name), ("p1", "apply_patch"));
        assert_eq!(input["input"], raw_input);

        let patch = ToolCallState {
            uuid: parsed.messages[0].uuid.clone(),
            name: name.to_string(),
            input: input.clone(),
            intent: ShellIntent::Other,
        };
        let bash = ToolCallState {
            name: "Bash".to_string(),
            input: json!({ "command": "make" }),
            ..patch.clone()
        };
        assert!(!patch.is_shell());
        assert!(bash.is_shell());
        let failed = |block: ContentBlock| matches!(block, ContentBlock::ToolResult { is_error: Some(true), .. });
        assert!(!failed(patch.result_block("p1", &json!("error: x"))));
        assert!(failed(bash.result_block("b1", &json!("error: x"))));

        // Error-looking text from a non-shell tool is not a failure
        let ContentBlock::ToolResult { is_error, .. } = &parsed.messages[1].content[0] else {
            panic!("expected tool_result");
        };
        assert_eq!(*is_error, Some(false));

        // A failed shell read has no Read-shaped result
        assert_eq!(tool_use(&parsed.messages[2]).1, "Read");
        let ContentBlock::ToolResult { is_error, structured, .. } = &parsed.messages[3].content[0] else {
            panic!("expected tool_result");
        };
        assert_eq!(*is_error, Some(true));
        assert!(structured.is_none());
    }

    #[test]
    fn compaction_and_token_count() {
        let log = [
            record("response_item", json!({
                "type": "message", "role": "assistant",
                "content": [{"type": "output_text", "text": "hello"}]
            })),
            record("compacted", json!({"message": ""})),
            record("event_msg", json!({
                "type": "token_count",
                "info": {"last_token_usage": {"input_tokens": 50000, "output_tokens": 10},
                         "model_context_window": 100000}
            })),
        ]
        .join("\n");
        let parsed = parse_codex_session(&log, "s1");
        assert_eq!(parsed.messages.len(), 2);
        assert!(parsed.messages[1].is_compact_boundary());
        let usage = parsed.context_usage.unwrap();
        assert_eq!(usage.context_window, 100000);
        assert_eq!(usage.percentage, 50.0);
    }
}
