//! Shared session types.
//!
//! This module defines the normalized message model every provider is mapped
//! into, and the cheap summary projection the index cache persists.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Subtype carried by synthesized compaction markers.
pub const COMPACT_BOUNDARY: &str = "compact_boundary";

/// Agent whose logs a session came from. Dispatch lives in `normalizer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Pi,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Pi => "pi",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            "pi" => Ok(Provider::Pi),
            other => Err(SyncError::UnknownProvider(other.to_string())),
        }
    }
}

/// Provenance of a message: an authoritative file read or a live push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    #[default]
    Jsonl,
    Sdk,
}

/// A normalized message from any source (Claude Code, Codex, Pi)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Legacy id, always present.
    pub uuid: String,
    /// Strong identity field; wins over `uuid` when present. Pi logs set it
    /// to the entry id. Claude's `message.id` is shared by every record of a
    /// streamed reply, so Claude messages only get one from live pushes.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Nearest emitted ancestor, only set for branching providers.
    #[serde(rename = "parentUuid", default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    pub role: String, // "user", "assistant", "system"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "_source", default)]
    pub source: SourceTag,
    #[serde(
        rename = "orphanedToolUseIds",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub orphaned_tool_use_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl NormalizedMessage {
    pub fn new(uuid: impl Into<String>, role: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            message_id: None,
            parent_uuid: None,
            role: role.into(),
            subtype: None,
            timestamp: timestamp.into(),
            content: Vec::new(),
            source: SourceTag::Jsonl,
            orphaned_tool_use_ids: Vec::new(),
            usage: None,
        }
    }

    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    /// Synthesized marker for a "context compacted" point in the log.
    pub fn compact_boundary(uuid: impl Into<String>, timestamp: impl Into<String>, text: &str) -> Self {
        let mut msg = Self::new(uuid, "system", timestamp);
        msg.subtype = Some(COMPACT_BOUNDARY.to_string());
        msg.content = vec![ContentBlock::Text { text: text.to_string() }];
        msg
    }

    /// Strong identifier when present, else the legacy id.
    pub fn canonical_id(&self) -> &str {
        self.message_id.as_deref().unwrap_or(&self.uuid)
    }

    /// Whether two messages denote the same logical message.
    pub fn same_identity(&self, other: &NormalizedMessage) -> bool {
        match (&self.message_id, &other.message_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.canonical_id() == other.canonical_id() || self.uuid == other.uuid,
        }
    }

    pub fn is_compact_boundary(&self) -> bool {
        self.subtype.as_deref() == Some(COMPACT_BOUNDARY)
    }

    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Concatenated text blocks, used for titles.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content block within a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        /// Re-derived result for shell calls reclassified as Read/Grep.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<StructuredResult>,
    },
    #[serde(rename = "image")]
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<ImageSource>,
    },
}

impl ContentBlock {
    /// Parse one content item in the Anthropic block shape. Pi's `toolCall`
    /// (with `arguments`) and flat `image` (`data` + `mimeType`) are accepted
    /// too. Empty text and unknown types yield None.
    pub fn from_value(item: &Value) -> Option<Self> {
        let str_field = |key: &str| item.get(key).and_then(|v| v.as_str());
        match str_field("type")? {
            "text" => {
                let text = str_field("text").filter(|t| !t.is_empty())?;
                Some(ContentBlock::Text { text: text.to_string() })
            }
            "thinking" => {
                let thinking = str_field("thinking").filter(|t| !t.is_empty())?;
                Some(ContentBlock::Thinking { thinking: thinking.to_string() })
            }
            "tool_use" | "toolCall" => Some(ContentBlock::ToolUse {
                id: str_field("id")?.to_string(),
                name: str_field("name")?.to_string(),
                input: item
                    .get("input")
                    .or_else(|| item.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            }),
            "tool_result" => Some(ContentBlock::ToolResult {
                tool_use_id: str_field("tool_use_id")?.to_string(),
                content: item.get("content").cloned().unwrap_or(Value::Null),
                is_error: item.get("is_error").and_then(|v| v.as_bool()),
                structured: None,
            }),
            "image" => {
                let source = match item.get("source") {
                    Some(source) => ImageSource::from_value(source),
                    None => Some(ImageSource {
                        source_type: "base64".to_string(),
                        media_type: str_field("mimeType").unwrap_or("image/png").to_string(),
                        data: str_field("data").unwrap_or("").to_string(),
                    }),
                };
                Some(ContentBlock::Image { source })
            }
            _ => None,
        }
    }
}

/// Blocks of a message `content`: a plain string or an array of items.
pub fn blocks_from_content(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(s) if !s.is_empty() => vec![ContentBlock::Text { text: s.clone() }],
        Value::Array(items) => items.iter().filter_map(ContentBlock::from_value).collect(),
        _ => vec![],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    fn from_value(source: &Value) -> Option<Self> {
        Some(Self {
            source_type: source.get("type")?.as_str()?.to_string(),
            media_type: source.get("media_type")?.as_str()?.to_string(),
            data: source.get("data")?.as_str()?.to_string(),
        })
    }
}

/// Structured tool result shaped like the native Read/Grep tools produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StructuredResult {
    #[serde(rename_all = "camelCase")]
    File {
        file_path: String,
        content: String,
        start_line: u64,
        num_lines: u64,
    },
    #[serde(rename_all = "camelCase")]
    Matches {
        filenames: Vec<String>,
        num_files: usize,
        num_matches: usize,
        content: String,
    },
}

/// Token usage reported for one assistant turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Tokens occupying the context window at the time of the turn.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub context_window: u64,
    pub percentage: f64,
}

impl ContextUsage {
    pub fn new(input_tokens: u64, context_window: u64) -> Self {
        let percentage = if context_window == 0 {
            0.0
        } else {
            ((input_tokens as f64 / context_window as f64) * 1000.0).round() / 10.0
        };
        Self {
            input_tokens,
            context_window,
            percentage,
        }
    }
}

/// Cheap, cacheable projection of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub project_id: String,
    pub provider: Provider,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<ContextUsage>,
}

/// A complete normalized session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub summary: SessionSummary,
    pub messages: Vec<NormalizedMessage>,
}

/// Derive a display title from the first user message, truncated to 50 chars.
pub fn title_from_messages(messages: &[NormalizedMessage]) -> Option<String> {
    let text = messages
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| m.text())
        .find(|t| !t.trim().is_empty())?;
    let text = text.trim();
    if text.len() > 50 {
        // Find valid UTF-8 boundary
        let mut end = 50;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        Some(format!("{}...", &text[..end]))
    } else {
        Some(text.to_string())
    }
}
