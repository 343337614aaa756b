// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Adapter for gemini's plain line protocol.
//!
//! The sparsest dialect of the three: no init record, no call ids, no final
//! usage. The supervisor synthesises `system.init`, the pairing layer
//! assigns `<tool>-<seq>-<rand>` ids and matches results FIFO by tool name.
//!
//! ```text
//! {"event":"content","text":"Looking at the code…"}
//! {"event":"tool_call","name":"read_file","args":{"path":"src/lib.rs"}}
//! {"event":"tool_result","name":"read_file","output":"…","error":false}
//! {"event":"done"}
//! {"event":"fatal","message":"quota exceeded"}
//! ```

use serde_json::Value;
use tracing::debug;

use crate::adapter::{ProviderEvent, StreamAdapter, TextRole};
use crate::format::{MessageFormatter, PlainFormatter};

#[derive(Debug, Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl StreamAdapter for GeminiAdapter {
    fn protocol_args(&self, _streaming_input: bool) -> Vec<String> {
        vec!["--format".to_string(), "jsonl".to_string()]
    }

    fn parse_line(&mut self, line: &str) -> Vec<ProviderEvent> {
        let v: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!("gemini: skipping non-protocol line: {e}");
                return vec![ProviderEvent::Ignored];
            }
        };
        match v.get("event").and_then(|e| e.as_str()).unwrap_or("") {
            "content" => {
                let text = v.get("text").and_then(|t| t.as_str()).unwrap_or("");
                vec![ProviderEvent::Text {
                    role: TextRole::Assistant,
                    text: text.to_string(),
                    delta: false,
                }]
            }
            "tool_call" => {
                let name = v
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("tool")
                    .to_string();
                vec![ProviderEvent::ToolCall {
                    id: None,
                    name,
                    input: v.get("args").cloned().unwrap_or(Value::Null),
                }]
            }
            "tool_result" => {
                let name = v.get("name").and_then(|n| n.as_str()).map(String::from);
                let output = v
                    .get("output")
                    .and_then(|o| o.as_str())
                    .unwrap_or("")
                    .to_string();
                let is_error = v.get("error").and_then(|e| e.as_bool()).unwrap_or(false);
                vec![ProviderEvent::ToolResult {
                    id: None,
                    name,
                    content: output,
                    is_error,
                }]
            }
            "done" => vec![ProviderEvent::Completed { last_text: None }],
            "fatal" => {
                let message = v
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("gemini reported a fatal error")
                    .to_string();
                vec![ProviderEvent::Errored { message }]
            }
            _ => vec![ProviderEvent::Ignored],
        }
    }

    fn encode_prompt(&self, text: &str) -> String {
        // Plain text, newline terminated. Gemini reads one prompt per run.
        let mut out = text.replace('\n', " ");
        out.push('\n');
        out
    }
}

// ── Formatter ─────────────────────────────────────────────────────────────────

pub struct GeminiFormatter;

impl MessageFormatter for GeminiFormatter {
    fn action_name(&self, tool: &str, input: &Value, is_error: bool) -> String {
        // Tool names arrive snake_cased; render them as words.
        let words = tool.replace('_', " ");
        if is_error {
            format!("{words} failed")
        } else {
            let mut chars = words.chars();
            match chars.next() {
                Some(first) => format!("{}{}", first.to_uppercase(), chars.as_str()),
                None => PlainFormatter.action_name(tool, input, is_error),
            }
        }
    }

    fn parameter(&self, tool: &str, input: &Value) -> String {
        PlainFormatter.parameter(tool, input)
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
    fn content_is_non_delta_assistant_text() {
        let mut a = GeminiAdapter::new();
        let events = a.parse_line(r#"{"event":"content","text":"Hi"}"#);
        assert_eq!(
            events,
            vec![ProviderEvent::Text {
                role: TextRole::Assistant,
                text: "Hi".into(),
                delta: false,
            }]
        );
    }

    #[test]
    fn tool_events_have_no_ids() {
        let mut a = GeminiAdapter::new();
        let call = a.parse_line(r#"{"event":"tool_call","name":"read_file","args":{"path":"x"}}"#);
        assert!(matches!(
            &call[0],
            ProviderEvent::ToolCall { id: None, name, .. } if name == "read_file"
        ));
        let result =
            a.parse_line(r#"{"event":"tool_result","name":"read_file","output":"data"}"#);
        assert!(matches!(
            &result[0],
            ProviderEvent::ToolResult { id: None, name: Some(n), .. } if n == "read_file"
        ));
    }

    #[test]
    fn done_and_fatal_terminate() {
        let mut a = GeminiAdapter::new();
        assert_eq!(
            a.parse_line(r#"{"event":"done"}"#),
            vec![ProviderEvent::Completed { last_text: None }]
        );
        assert!(matches!(
            &a.parse_line(r#"{"event":"fatal","message":"quota exceeded"}"#)[0],
            ProviderEvent::Errored { message } if message == "quota exceeded"
        ));
    }

    #[test]
    fn formatter_humanises_snake_case() {
        let f = GeminiFormatter;
        assert_eq!(
            f.action_name("read_file", &Value::Null, false),
            "Read file"
        );
        assert_eq!(
            f.action_name("read_file", &Value::Null, true),
            "read file failed"
        );
    }
}
