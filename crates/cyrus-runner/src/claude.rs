// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Adapter for the claude CLI's `stream-json` dialect.
//!
//! One JSON object per stdout line:
//!
//! ```text
//! {"type":"system","subtype":"init","session_id":…,"cwd":…,"tools":[…],…}
//! {"type":"assistant","message":{"model":…,"content":[{"type":"text",…},
//!                                {"type":"tool_use","id":…,"name":…,"input":…}]}}
//! {"type":"user","message":{"content":[{"type":"tool_result",
//!                                "tool_use_id":…,"content":…,"is_error":…}]}}
//! {"type":"result","subtype":"success"|…,"duration_ms":…,"usage":{…},"result":…}
//! ```
//!
//! The dialect threads tool ids and sends a real init, so the supervisor's
//! synthesis paths stay idle for this provider.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use cyrus_protocol::{McpServerInfo, SystemInit, Usage};

use crate::adapter::{ProviderEvent, StreamAdapter, TextRole};
use crate::format::{truncate, MessageFormatter, PlainFormatter};

#[derive(Debug, Default)]
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeLine {
    System(SystemLine),
    Assistant { message: ApiMessage },
    User { message: ApiMessage },
    Result(ResultLine),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct SystemLine {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    model: String,
    #[serde(default, rename = "permissionMode")]
    permission_mode: String,
    #[serde(default)]
    mcp_servers: Vec<McpServerLine>,
}

#[derive(Debug, Deserialize)]
struct McpServerLine {
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    usage: UsageLine,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageLine {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl From<UsageLine> for Usage {
    fn from(u: UsageLine) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cached_input_tokens: u.cache_read_input_tokens,
        }
    }
}

/// Tool-result content arrives as a string or as an array of text blocks.
fn result_content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl StreamAdapter for ClaudeAdapter {
    fn protocol_args(&self, streaming_input: bool) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if streaming_input {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        } else {
            args.push("--print".to_string());
        }
        args
    }

    fn parse_line(&mut self, line: &str) -> Vec<ProviderEvent> {
        let parsed: ClaudeLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                debug!("claude: skipping non-protocol line: {e}");
                return vec![ProviderEvent::Ignored];
            }
        };

        match parsed {
            ClaudeLine::System(sys) if sys.subtype == "init" => {
                vec![ProviderEvent::Init(SystemInit {
                    session_id: sys.session_id,
                    cwd: sys.cwd,
                    tools: sys.tools,
                    model: sys.model,
                    permission_mode: sys.permission_mode,
                    mcp_servers: sys
                        .mcp_servers
                        .into_iter()
                        .map(|m| McpServerInfo {
                            name: m.name,
                            status: m.status,
                        })
                        .collect(),
                })]
            }
            ClaudeLine::System(_) => vec![ProviderEvent::Ignored],
            ClaudeLine::Assistant { message } => {
                let mut events = Vec::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => events.push(ProviderEvent::Text {
                            role: TextRole::Assistant,
                            text,
                            delta: false,
                        }),
                        ContentBlock::ToolUse { id, name, input } => {
                            events.push(ProviderEvent::ToolCall {
                                id: Some(id),
                                name,
                                input,
                            })
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
                    }
                }
                if events.is_empty() {
                    events.push(ProviderEvent::Ignored);
                }
                let _ = message.model;
                events
            }
            ClaudeLine::User { message } => {
                let mut events = Vec::new();
                for block in message.content {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => events.push(ProviderEvent::ToolResult {
                            id: Some(tool_use_id),
                            name: None,
                            content: result_content_text(&content),
                            is_error,
                        }),
                        ContentBlock::Text { text } => events.push(ProviderEvent::Text {
                            role: TextRole::User,
                            text,
                            delta: false,
                        }),
                        _ => {}
                    }
                }
                if events.is_empty() {
                    events.push(ProviderEvent::Ignored);
                }
                events
            }
            ClaudeLine::Result(result) => {
                let usage: Usage = result.usage.into();
                let mut events = vec![ProviderEvent::Usage(usage)];
                if result.subtype == "success" {
                    events.push(ProviderEvent::Completed {
                        last_text: result.result,
                    });
                } else {
                    let message = result
                        .error
                        .or(result.result)
                        .unwrap_or_else(|| result.subtype.clone());
                    events.push(ProviderEvent::Errored { message });
                }
                let _ = result.duration_ms;
                events
            }
            ClaudeLine::Unknown => vec![ProviderEvent::Ignored],
        }
    }

    fn encode_prompt(&self, text: &str) -> String {
        // Streaming input is itself stream-json: one user message per line.
        let msg = serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": [{"type": "text", "text": text}]},
        });
        format!("{msg}\n")
    }
}

// ── Formatter ─────────────────────────────────────────────────────────────────

pub struct ClaudeFormatter;

impl MessageFormatter for ClaudeFormatter {
    fn action_name(&self, tool: &str, input: &Value, is_error: bool) -> String {
        let verb = match tool {
            "Read" => "Reading",
            "Write" => "Writing",
            "Edit" | "MultiEdit" => "Editing",
            "Bash" => "Running",
            "Grep" => "Searching",
            "Glob" => "Globbing",
            "WebFetch" => "Fetching",
            "TodoWrite" => "Updating todo list",
            "Task" => "Delegating",
            _ => return PlainFormatter.action_name(tool, input, is_error),
        };
        if is_error {
            format!("{verb} failed")
        } else {
            verb.to_string()
        }
    }

    fn parameter(&self, tool: &str, input: &Value) -> String {
        match tool {
            "Bash" => input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|c| format!("`{}`", truncate(c, 200)))
                .unwrap_or_default(),
            "TodoWrite" => input
                .get("todos")
                .and_then(|v| v.as_array())
                .map(|t| format!("{} item(s)", t.len()))
                .unwrap_or_default(),
            _ => PlainFormatter.parameter(tool, input),
        }
    }

    fn result(&self, tool: &str, input: &Value, raw: &str, is_error: bool) -> String {
        if tool == "TodoWrite" && !is_error {
            return "Todo list updated.".to_string();
        }
        PlainFormatter.result(tool, input, raw, is_error)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
