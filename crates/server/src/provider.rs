// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider capability layer: one implementation per agent CLI backend.
//!
//! A provider knows how to spawn its CLI, how to turn the CLI's stdout lines
//! into normalized [`AgentEvent`]s, and how to encode inputs back to the
//! child's stdin. The process driver is provider-agnostic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;

use crate::config::home_dir;
use crate::queue::QueuedMessage;
use crate::record::{now_ms, MessageBody, PendingRequest, PermissionMode, SessionRecord};

/// Normalized event emitted by an agent subprocess.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The child announced its own session id.
    SessionStarted { session_id: String },
    /// Text delta for the currently-forming assistant message.
    StreamDelta { text: String },
    /// Thinking delta; delivered live, never sealed into the message text.
    ThinkingDelta { text: String },
    /// A complete record (assistant/user/tool) ready for the log.
    Record { record: SessionRecord },
    /// The child is blocked on an approval or question.
    PermissionRequest { request: PendingRequest },
    /// The turn finished; the accumulated message can be sealed.
    TurnComplete { result: Option<serde_json::Value> },
    /// Unclassified stream event, forwarded to subscribers verbatim.
    Raw { event: serde_json::Value },
}

/// Provider credential state, as far as the CLI exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Authenticated,
    NeedsLogin,
    Unknown,
}

/// Everything needed to spawn one agent subprocess.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub project_path: PathBuf,
    pub mode: PermissionMode,
    pub resume_session_id: Option<String>,
    /// Executable override from `--agent-cmd` (tests, harnesses).
    pub agent_cmd: Option<String>,
}

/// Capability interface implemented once per agent CLI backend.
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Executable looked up on PATH when no override is configured.
    fn executable(&self) -> &'static str;

    fn is_installed(&self) -> bool {
        path_lookup(self.executable())
    }

    fn auth_status(&self) -> AuthStatus;

    /// Build the subprocess command (argv, cwd, stdio wiring is the caller's).
    fn command(&self, opts: &SpawnOptions) -> Command;

    /// Normalize one stdout line into zero or more events.
    ///
    /// Malformed lines normalize to nothing; the driver logs and skips.
    fn normalize(&self, line: &str) -> Vec<AgentEvent>;

    /// Encode a queued user message as one stdin line.
    fn encode_user_message(&self, msg: &QueuedMessage) -> String;

    /// Encode an approval/denial for a pending request as one stdin line.
    fn encode_approval(&self, request_id: &str, approve: bool, answer: Option<&str>) -> String;

    /// Encode a live permission-mode change, when the backend supports one.
    fn encode_set_mode(&self, mode: PermissionMode) -> Option<String>;
}

/// Registry of known providers, keyed by name.
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut providers: HashMap<&'static str, Arc<dyn Provider>> = HashMap::new();
        providers.insert("claude", Arc::new(ClaudeProvider));
        providers.insert("codex", Arc::new(CodexProvider));
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn path_lookup(executable: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(executable).is_file())
}

fn base_command(executable: &'static str, opts: &SpawnOptions) -> Command {
    let program = opts.agent_cmd.clone().unwrap_or_else(|| executable.to_owned());
    let mut cmd = Command::new(program);
    cmd.current_dir(&opts.project_path);
    cmd
}

// -- Claude -------------------------------------------------------------------

/// The Claude Code CLI in bidirectional stream-json mode.
pub struct ClaudeProvider;

impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn executable(&self) -> &'static str {
        "claude"
    }

    fn auth_status(&self) -> AuthStatus {
        if std::env::var_os("ANTHROPIC_API_KEY").is_some() {
            return AuthStatus::Authenticated;
        }
        if home_dir().join(".claude").join(".credentials.json").exists() {
            return AuthStatus::Authenticated;
        }
        AuthStatus::NeedsLogin
    }

    fn command(&self, opts: &SpawnOptions) -> Command {
        let mut cmd = base_command(self.executable(), opts);
        cmd.args([
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--include-partial-messages",
            "--verbose",
        ]);
        if opts.mode != PermissionMode::Default {
            cmd.args(["--permission-mode", opts.mode.as_str()]);
        }
        if let Some(ref sid) = opts.resume_session_id {
            cmd.args(["--resume", sid]);
        }
        cmd
    }

    fn normalize(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            return vec![];
        };
        let ts = now_ms();
        match value.get("type").and_then(|t| t.as_str()) {
            Some("system") if value.get("subtype").and_then(|s| s.as_str()) == Some("init") => {
                let Some(session_id) = value.get("session_id").and_then(|s| s.as_str()) else {
                    return vec![];
                };
                let record = SessionRecord::SystemInit {
                    timestamp: ts,
                    session_id: session_id.to_owned(),
                    cwd: value.get("cwd").and_then(|c| c.as_str()).unwrap_or_default().to_owned(),
                    provider: Some("claude".to_owned()),
                };
                vec![
                    AgentEvent::SessionStarted { session_id: session_id.to_owned() },
                    AgentEvent::Record { record },
                ]
            }
            Some("assistant") | Some("user") => {
                let Some(message) = value.get("message") else {
                    return vec![];
                };
                let Ok(body) = serde_json::from_value::<MessageBody>(normalize_message(message))
                else {
                    return vec![];
                };
                let uuid = value
                    .get("uuid")
                    .or_else(|| message.get("id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let parent_uuid =
                    value.get("parentUuid").and_then(|v| v.as_str()).map(str::to_owned);
                let record = if body.role == "assistant" {
                    SessionRecord::Assistant { uuid, parent_uuid, timestamp: ts, message: body }
                } else {
                    SessionRecord::User { uuid, parent_uuid, timestamp: ts, message: body }
                };
                vec![AgentEvent::Record { record }]
            }
            Some("stream_event") => {
                let Some(event) = value.get("event") else {
                    return vec![];
                };
                match delta_text(event) {
                    Some(("text_delta", text)) => {
                        vec![AgentEvent::StreamDelta { text: text.to_owned() }]
                    }
                    Some(("thinking_delta", text)) => {
                        vec![AgentEvent::ThinkingDelta { text: text.to_owned() }]
                    }
                    _ => vec![AgentEvent::Raw { event: event.clone() }],
                }
            }
            Some("result") => vec![AgentEvent::TurnComplete { result: Some(value) }],
            Some("control_request") => {
                let Some(request_id) = value.get("request_id").and_then(|v| v.as_str()) else {
                    return vec![];
                };
                let request = value.get("request").cloned().unwrap_or_default();
                let subtype = request.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                let pending = PendingRequest {
                    id: request_id.to_owned(),
                    kind: if subtype == "can_use_tool" {
                        "tool_approval".to_owned()
                    } else {
                        "user_question".to_owned()
                    },
                    tool_name: request
                        .get("tool_name")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    input: request.get("input").cloned(),
                    prompt: request.get("prompt").and_then(|v| v.as_str()).map(str::to_owned),
                };
                vec![AgentEvent::PermissionRequest { request: pending }]
            }
            _ => vec![AgentEvent::Raw { event: value }],
        }
    }

    fn encode_user_message(&self, msg: &QueuedMessage) -> String {
        let mut content = vec![serde_json::json!({"type": "text", "text": msg.text})];
        for attachment in &msg.attachments {
            content.push(serde_json::json!({
                "type": "text",
                "text": format!("[attachment: {}]", attachment.file_name),
            }));
        }
        serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": content},
        })
        .to_string()
    }

    fn encode_approval(&self, request_id: &str, approve: bool, answer: Option<&str>) -> String {
        let response = if approve {
            serde_json::json!({"behavior": "allow"})
        } else {
            serde_json::json!({
                "behavior": "deny",
                "message": answer.unwrap_or("denied by user"),
            })
        };
        serde_json::json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": response,
            },
        })
        .to_string()
    }

    fn encode_set_mode(&self, mode: PermissionMode) -> Option<String> {
        Some(
            serde_json::json!({
                "type": "control_request",
                "request_id": uuid::Uuid::new_v4().to_string(),
                "request": {"subtype": "set_permission_mode", "mode": mode.as_str()},
            })
            .to_string(),
        )
    }
}

/// Strip provider extras (id, model, usage) down to `{role, content}` and
/// flatten string content into a single text block.
fn normalize_message(message: &serde_json::Value) -> serde_json::Value {
    let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
    let content = match message.get("content") {
        Some(serde_json::Value::String(text)) => {
            serde_json::json!([{"type": "text", "text": text}])
        }
        Some(content) => content.clone(),
        None => serde_json::json!([]),
    };
    serde_json::json!({"role": role, "content": content})
}

fn delta_text(event: &serde_json::Value) -> Option<(&str, &str)> {
    if event.get("type").and_then(|t| t.as_str()) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    let kind = delta.get("type").and_then(|t| t.as_str())?;
    match kind {
        "text_delta" => Some(("text_delta", delta.get("text")?.as_str()?)),
        "thinking_delta" => Some(("thinking_delta", delta.get("thinking")?.as_str()?)),
        _ => None,
    }
}

// -- Codex --------------------------------------------------------------------

/// The Codex CLI driven over its `proto` stdin/stdout protocol.
pub struct CodexProvider;

impl Provider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn executable(&self) -> &'static str {
        "codex"
    }

    fn auth_status(&self) -> AuthStatus {
        if std::env::var_os("OPENAI_API_KEY").is_some() {
            return AuthStatus::Authenticated;
        }
        if home_dir().join(".codex").join("auth.json").exists() {
            return AuthStatus::Authenticated;
        }
        AuthStatus::NeedsLogin
    }

    fn command(&self, opts: &SpawnOptions) -> Command {
        let mut cmd = base_command(self.executable(), opts);
        cmd.arg("proto");
        cmd
    }

    fn normalize(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            return vec![];
        };
        let Some(msg) = value.get("msg") else {
            return vec![AgentEvent::Raw { event: value }];
        };
        let ts = now_ms();
        let event_id =
            value.get("id").and_then(|v| v.as_str()).map(str::to_owned).unwrap_or_default();
        match msg.get("type").and_then(|t| t.as_str()) {
            Some("session_configured") => {
                match msg.get("session_id").and_then(|s| s.as_str()) {
                    Some(sid) => {
                        vec![AgentEvent::SessionStarted { session_id: sid.to_owned() }]
                    }
                    None => vec![],
                }
            }
            Some("agent_message_delta") => match msg.get("delta").and_then(|d| d.as_str()) {
                Some(delta) => vec![AgentEvent::StreamDelta { text: delta.to_owned() }],
                None => vec![],
            },
            Some("agent_reasoning_delta") => match msg.get("delta").and_then(|d| d.as_str()) {
                Some(delta) => vec![AgentEvent::ThinkingDelta { text: delta.to_owned() }],
                None => vec![],
            },
            Some("agent_message") => {
                let text = msg.get("message").and_then(|m| m.as_str()).unwrap_or_default();
                let record = SessionRecord::Assistant {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    parent_uuid: None,
                    timestamp: ts,
                    message: MessageBody::assistant_text(text),
                };
                vec![AgentEvent::Record { record }]
            }
            Some("exec_command_begin") => {
                let call_id =
                    msg.get("call_id").and_then(|v| v.as_str()).unwrap_or(&event_id).to_owned();
                let record = SessionRecord::ToolUse {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    parent_uuid: None,
                    timestamp: ts,
                    id: call_id,
                    name: "exec".to_owned(),
                    input: msg.get("command").cloned().unwrap_or_default(),
                };
                vec![AgentEvent::Record { record }]
            }
            Some("exec_command_end") => {
                let call_id =
                    msg.get("call_id").and_then(|v| v.as_str()).unwrap_or(&event_id).to_owned();
                let exit_code = msg.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(0);
                let record = SessionRecord::ToolResult {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    parent_uuid: None,
                    timestamp: ts,
                    tool_use_id: call_id,
                    content: msg.get("stdout").cloned().unwrap_or_default(),
                    is_error: Some(exit_code != 0),
                };
                vec![AgentEvent::Record { record }]
            }
            Some("exec_approval_request") => {
                let request = PendingRequest {
                    id: event_id,
                    kind: "tool_approval".to_owned(),
                    tool_name: Some("exec".to_owned()),
                    input: msg.get("command").cloned(),
                    prompt: None,
                };
                vec![AgentEvent::PermissionRequest { request }]
            }
            Some("task_complete") => vec![AgentEvent::TurnComplete { result: None }],
            _ => vec![AgentEvent::Raw { event: value }],
        }
    }

    fn encode_user_message(&self, msg: &QueuedMessage) -> String {
        serde_json::json!({
            "id": msg.id,
            "op": {
                "type": "user_input",
                "items": [{"type": "text", "text": msg.text}],
            },
        })
        .to_string()
    }

    fn encode_approval(&self, request_id: &str, approve: bool, _answer: Option<&str>) -> String {
        serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "op": {
                "type": "exec_approval",
                "id": request_id,
                "decision": if approve { "approved" } else { "denied" },
            },
        })
        .to_string()
    }

    fn encode_set_mode(&self, _mode: PermissionMode) -> Option<String> {
        // The proto protocol fixes the approval policy at spawn time.
        None
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
