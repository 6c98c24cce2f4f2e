// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session record data model and the ProjectId codec.
//!
//! Records are the JSONL entries of a session log. Field names are camelCase
//! on the wire and on disk (`parentUuid`, `toolUseId`) for log compatibility;
//! the `type` tag is snake_case.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Encode an absolute filesystem path as a URL-safe project id.
pub fn encode_project_id(path: &Path) -> String {
    B64.encode(path.as_os_str().as_encoded_bytes())
}

/// Decode a project id back to the absolute path it was encoded from.
///
/// Rejects empty input, non-base64url characters, non-UTF-8 payloads, and
/// relative paths.
pub fn decode_project_id(id: &str) -> anyhow::Result<PathBuf> {
    if id.is_empty() {
        anyhow::bail!("empty project id");
    }
    if !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        anyhow::bail!("project id contains invalid characters");
    }
    let bytes = B64.decode(id)?;
    let s = String::from_utf8(bytes)?;
    let path = PathBuf::from(s);
    if !path.is_absolute() {
        anyhow::bail!("project id does not decode to an absolute path");
    }
    Ok(path)
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Permission mode an agent process runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "acceptEdits" => Some(Self::AcceptEdits),
            "plan" => Some(Self::Plan),
            "bypassPermissions" => Some(Self::BypassPermissions),
            _ => None,
        }
    }

    /// Next mode in the cycling order used by the mode-cycle shortcut.
    pub fn cycle_next(&self) -> Self {
        match self {
            Self::Default => Self::AcceptEdits,
            Self::AcceptEdits => Self::Plan,
            Self::Plan => Self::BypassPermissions,
            Self::BypassPermissions => Self::Default,
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One content block inside a message payload.
///
/// Field names follow the agent wire shape (`tool_use_id`, `is_error`), so
/// provider output deserializes without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Message payload: the speaking role plus its content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl MessageBody {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: "user".to_owned(), content: vec![ContentBlock::Text { text: text.into() }] }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_owned(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all `text` blocks.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// A request the agent is blocked on while in `waiting-input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    /// `tool_approval` or `user_question`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Queue book-keeping operation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    Enqueue,
    Dequeue,
    Clear,
    NotDelivered,
}

/// One entry of a session log, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRecord {
    #[serde(rename_all = "camelCase")]
    User {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_uuid: Option<String>,
        timestamp: u64,
        message: MessageBody,
    },
    #[serde(rename_all = "camelCase")]
    Assistant {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_uuid: Option<String>,
        timestamp: u64,
        message: MessageBody,
    },
    /// In-flight streaming chunk. Only delivered live, never replayed.
    #[serde(rename_all = "camelCase")]
    StreamEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uuid: Option<String>,
        timestamp: u64,
        event: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_uuid: Option<String>,
        timestamp: u64,
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_uuid: Option<String>,
        timestamp: u64,
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    SystemInit {
        timestamp: u64,
        session_id: String,
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SystemStatus {
        timestamp: u64,
        subtype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    QueueOperation {
        timestamp: u64,
        op: QueueOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CompactBoundary {
        uuid: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        uuid: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_turns: Option<u64>,
        #[serde(default)]
        is_error: bool,
    },
}

impl SessionRecord {
    /// Stable identifier within the session, when the kind carries one.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::User { uuid, .. }
            | Self::Assistant { uuid, .. }
            | Self::ToolUse { uuid, .. }
            | Self::ToolResult { uuid, .. }
            | Self::CompactBoundary { uuid, .. }
            | Self::Result { uuid, .. } => Some(uuid),
            Self::StreamEvent { uuid, .. } => uuid.as_deref(),
            Self::SystemInit { .. } | Self::SystemStatus { .. } | Self::QueueOperation { .. } => {
                None
            }
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::User { timestamp, .. }
            | Self::Assistant { timestamp, .. }
            | Self::StreamEvent { timestamp, .. }
            | Self::ToolUse { timestamp, .. }
            | Self::ToolResult { timestamp, .. }
            | Self::SystemInit { timestamp, .. }
            | Self::SystemStatus { timestamp, .. }
            | Self::QueueOperation { timestamp, .. }
            | Self::CompactBoundary { timestamp, .. }
            | Self::Result { timestamp, .. } => *timestamp,
        }
    }

    /// Internal book-keeping kinds are excluded from `Read()` results.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, Self::QueueOperation { .. } | Self::SystemStatus { .. })
    }

    /// Streaming chunks are delivered live but never replayed.
    pub fn is_stream_chunk(&self) -> bool {
        matches!(self, Self::StreamEvent { .. })
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            uuid: uuid::Uuid::new_v4().to_string(),
            parent_uuid: None,
            timestamp: now_ms(),
            message: MessageBody::user_text(text),
        }
    }
}

/// Build a uuid → index lookup over a flat record slice.
///
/// The record DAG (`parentUuid` → `uuid`, `tool_use_id` back-references) is
/// traversed through this table; records never hold object back-pointers.
pub fn index_by_uuid(records: &[SessionRecord]) -> HashMap<&str, usize> {
    let mut map = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if let Some(uuid) = record.uuid() {
            map.insert(uuid, i);
        }
    }
    map
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
