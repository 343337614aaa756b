// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Adapter for the codex CLI's line protocol.
//!
//! Codex streams assistant prose as deltas and pairs tool activity through
//! `call_id`:
//!
//! ```text
//! {"type":"session_configured","session_id":…,"model":…}
//! {"type":"agent_message_delta","delta":"par"}
//! {"type":"agent_message_delta","delta":"tial"}
//! {"type":"agent_message","message":"partial …full text"}
//! {"type":"exec_command_begin","call_id":…,"command":["cargo","test"]}
//! {"type":"exec_command_end","call_id":…,"exit_code":0,"aggregated_output":…}
//! {"type":"token_count","input_tokens":…,"output_tokens":…}
//! {"type":"task_complete","last_agent_message":…}
//! ```
//!
//! `session_configured` carries the session token but not the rest of an
//! init record, so the supervisor synthesises the canonical `system.init`
//! around it. Deltas exercise the accumulator: a non-delta `agent_message`
//! replaces whatever was accumulated for the same text run.

use serde_json::Value;
use tracing::debug;

use cyrus_protocol::Usage;

use crate::adapter::{ProviderEvent, StreamAdapter, TextRole};
use crate::format::{truncate, MessageFormatter, PlainFormatter};

#[derive(Debug, Default)]
pub struct CodexAdapter {
    /// Bytes of assistant prose already emitted as deltas for the current
    /// run; a full `agent_message` repeats them, so the overlap is dropped.
    delta_run_len: usize,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamAdapter for CodexAdapter {
    fn protocol_args(&self, _streaming_input: bool) -> Vec<String> {
        vec!["proto".to_string(), "--json".to_string()]
    }

    fn parse_line(&mut self, line: &str) -> Vec<ProviderEvent> {
        let v: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!("codex: skipping non-protocol line: {e}");
                return vec![ProviderEvent::Ignored];
            }
        };
        let kind = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match kind {
            "session_configured" => {
                let mut events = Vec::new();
                if let Some(id) = v.get("session_id").and_then(|s| s.as_str()) {
                    events.push(ProviderEvent::SessionId(id.to_string()));
                }
                if events.is_empty() {
                    events.push(ProviderEvent::Ignored);
                }
                events
            }
            "agent_message_delta" => {
                let delta = v.get("delta").and_then(|d| d.as_str()).unwrap_or("");
                self.delta_run_len += delta.len();
                vec![ProviderEvent::Text {
                    role: TextRole::Assistant,
                    text: delta.to_string(),
                    delta: true,
                }]
            }
            "agent_message" => {
                // The full message repeats the deltas already streamed; only
                // the unseen tail (if any) is new.
                let full = v.get("message").and_then(|m| m.as_str()).unwrap_or("");
                let tail = full.get(self.delta_run_len..).unwrap_or("");
                self.delta_run_len = 0;
                if tail.is_empty() {
                    // Pure flush: a zero-length delta forces the accumulator
                    // run to close on the next non-delta event.
                    vec![ProviderEvent::Text {
                        role: TextRole::User,
                        text: String::new(),
                        delta: false,
                    }]
                } else {
                    vec![ProviderEvent::Text {
                        role: TextRole::Assistant,
                        text: tail.to_string(),
                        delta: false,
                    }]
                }
            }
            "exec_command_begin" => {
                let call_id = v.get("call_id").and_then(|c| c.as_str()).map(String::from);
                let command = v.get("command").cloned().unwrap_or(Value::Null);
                vec![ProviderEvent::ToolCall {
                    id: call_id,
                    name: "exec_command".to_string(),
                    input: serde_json::json!({ "command": command }),
                }]
            }
            "exec_command_end" => {
                let call_id = v.get("call_id").and_then(|c| c.as_str()).map(String::from);
                let exit_code = v.get("exit_code").and_then(|c| c.as_i64()).unwrap_or(0);
                let output = v
                    .get("aggregated_output")
                    .and_then(|o| o.as_str())
                    .unwrap_or("")
                    .to_string();
                vec![ProviderEvent::ToolResult {
                    id: call_id,
                    name: Some("exec_command".to_string()),
                    content: output,
                    is_error: exit_code != 0,
                }]
            }
            "patch_apply_begin" => {
                let call_id = v.get("call_id").and_then(|c| c.as_str()).map(String::from);
                vec![ProviderEvent::ToolCall {
                    id: call_id,
                    name: "apply_patch".to_string(),
                    input: v.get("changes").cloned().unwrap_or(Value::Null),
                }]
            }
            "patch_apply_end" => {
                let call_id = v.get("call_id").and_then(|c| c.as_str()).map(String::from);
                let success = v.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
                vec![ProviderEvent::ToolResult {
                    id: call_id,
                    name: Some("apply_patch".to_string()),
                    content: if success { "patch applied".into() } else { "patch failed".into() },
                    is_error: !success,
                }]
            }
            "token_count" => {
                let usage = Usage {
                    input_tokens: v.get("input_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
                    output_tokens: v.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
                    cached_input_tokens: v
                        .get("cached_input_tokens")
                        .and_then(|t| t.as_u64())
                        .unwrap_or(0),
                };
                vec![ProviderEvent::Usage(usage)]
            }
            "task_complete" => {
                let last = v
                    .get("last_agent_message")
                    .and_then(|m| m.as_str())
                    .map(String::from);
                vec![ProviderEvent::Completed { last_text: last }]
            }
            "error" => {
                let message = v
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("codex reported an error")
                    .to_string();
                vec![ProviderEvent::Errored { message }]
            }
            _ => vec![ProviderEvent::Ignored],
        }
    }

    fn encode_prompt(&self, text: &str) -> String {
        let msg = serde_json::json!({
            "type": "user_input",
            "items": [{"type": "text", "text": text}],
        });
        format!("{msg}\n")
    }
}

// ── Formatter ─────────────────────────────────────────────────────────────────

pub struct CodexFormatter;

impl CodexFormatter {
    fn command_string(input: &Value) -> Option<String> {
        match input.get("command") {
            Some(Value::Array(parts)) => Some(
                parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

impl MessageFormatter for CodexFormatter {
    fn action_name(&self, tool: &str, input: &Value, is_error: bool) -> String {
        match tool {
            "exec_command" => {
                if is_error {
                    "Command failed".to_string()
                } else {
                    "Running command".to_string()
                }
            }
            "apply_patch" => {
                if is_error {
                    "Patch failed".to_string()
                } else {
                    "Applying patch".to_string()
                }
            }
            _ => PlainFormatter.action_name(tool, input, is_error),
        }
    }

    fn parameter(&self, tool: &str, input: &Value) -> String {
        match tool {
            "exec_command" => Self::command_string(input)
                .map(|c| format!("`{}`", truncate(&c, 200)))
                .unwrap_or_default(),
            _ => PlainFormatter.parameter(tool, input),
        }
    }

    fn result(&self, tool: &str, input: &Value, raw: &str, is_error: bool) -> String {
        PlainFormatter.result(tool, input, raw, is_error)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_configured_yields_session_id() {
        let mut a = CodexAdapter::new();
        let events =
            a.parse_line(r#"{"type":"session_configured","session_id":"cdx-1","model":"o4"}"#);
        assert_eq!(events, vec![ProviderEvent::SessionId("cdx-1".into())]);
    }

    #[test]
    fn deltas_are_marked_delta() {
        let mut a = CodexAdapter::new();
        let events = a.parse_line(r#"{"type":"agent_message_delta","delta":"Hel"}"#);
        assert_eq!(
            events,
            vec![ProviderEvent::Text {
                role: TextRole::Assistant,
                text: "Hel".into(),
                delta: true,
            }]
        );
    }

    #[test]
    fn full_message_emits_only_unseen_tail() {
        let mut a = CodexAdapter::new();
        a.parse_line(r#"{"type":"agent_message_delta","delta":"Hello "}"#);
        a.parse_line(r#"{"type":"agent_message_delta","delta":"wor"}"#);
        let events = a.parse_line(r#"{"type":"agent_message","message":"Hello world"}"#);
        assert_eq!(
            events,
            vec![ProviderEvent::Text {
                role: TextRole::Assistant,
                text: "ld".into(),
                delta: false,
            }]
        );
    }

    #[test]
    fn exec_pairing_uses_call_id_and_exit_code() {
        let mut a = CodexAdapter::new();
        let begin = a.parse_line(
            r#"{"type":"exec_command_begin","call_id":"c1","command":["cargo","test"]}"#,
        );
        assert!(matches!(
            &begin[0],
            ProviderEvent::ToolCall { id: Some(id), name, .. }
            if id == "c1" && name == "exec_command"
        ));

        let end = a.parse_line(
            r#"{"type":"exec_command_end","call_id":"c1","exit_code":2,"aggregated_output":"boom"}"#,
        );
        assert!(matches!(
            &end[0],
            ProviderEvent::ToolResult { id: Some(id), is_error: true, content, .. }
            if id == "c1" && content == "boom"
        ));
    }

    #[test]
    fn task_complete_is_completed() {
        let mut a = CodexAdapter::new();
        let events =
            a.parse_line(r#"{"type":"task_complete","last_agent_message":"done"}"#);
        assert_eq!(
            events,
            vec![ProviderEvent::Completed {
                last_text: Some("done".into())
            }]
        );
    }

    #[test]
    fn formatter_renders_command_arrays() {
        let f = CodexFormatter;
        let input = serde_json::json!({"command": ["git", "status"]});
        assert_eq!(f.parameter("exec_command", &input), "`git status`");
        assert_eq!(f.action_name("exec_command", &input, false), "Running command");
    }
}
