// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Canonical messages → surface activities.
//!
//! One translator per session. Tool calls become ephemeral "working…"
//! actions that the matching tool result replaces; assistant prose becomes
//! responses; terminal results become a closing response or error carrying
//! the stop signal. The sink's ephemeral-replacement semantics guarantee
//! that a pending action never outlives the next activity.

use std::collections::HashMap;
use std::sync::Arc;

use cyrus_protocol::{
    Activity, ActivitySignal, AgentMessage, AssistantBlock,
};
use cyrus_runner::MessageFormatter;

pub struct Translator {
    formatter: Arc<dyn MessageFormatter>,
    /// tool_use id → (name, input), for rendering the paired result.
    pending_tools: HashMap<String, (String, serde_json::Value)>,
    last_response_text: Option<String>,
}

impl Translator {
    pub fn new(formatter: Arc<dyn MessageFormatter>) -> Self {
        Self {
            formatter,
            pending_tools: HashMap::new(),
            last_response_text: None,
        }
    }

    /// Translate one message into zero or more activities, in order.
    pub fn translate(&mut self, msg: &AgentMessage) -> Vec<Activity> {
        match msg {
            AgentMessage::SystemInit(init) => {
                vec![Activity::thought(format!(
                    "Session started (`{}` in `{}`)",
                    init.model, init.cwd
                ))
                .ephemeral()]
            }
            AgentMessage::User { .. } => Vec::new(),
            AgentMessage::Assistant { content, .. } => {
                let mut out = Vec::new();
                for block in content {
                    match block {
                        AssistantBlock::Text { text } => {
                            if !text.trim().is_empty() {
                                self.last_response_text = Some(text.clone());
                                out.push(Activity::response(text.clone()));
                            }
                        }
                        AssistantBlock::ToolUse(tool) => {
                            self.pending_tools
                                .insert(tool.id.clone(), (tool.name.clone(), tool.input.clone()));
                            let action =
                                self.formatter.action_name(&tool.name, &tool.input, false);
                            let param = self.formatter.parameter(&tool.name, &tool.input);
                            let body = if param.is_empty() {
                                format!("**{action}**")
                            } else {
                                format!("**{action}** {param}")
                            };
                            out.push(Activity::action(body).ephemeral());
                        }
                    }
                }
                out
            }
            AgentMessage::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let (name, input) = self
                    .pending_tools
                    .remove(tool_use_id)
                    .unwrap_or_else(|| ("tool".to_string(), serde_json::Value::Null));
                let action = self.formatter.action_name(&name, &input, *is_error);
                let param = self.formatter.parameter(&name, &input);
                let rendered = self.formatter.result(&name, &input, content, *is_error);
                let mut body = format!("**{action}**");
                if !param.is_empty() {
                    body.push(' ');
                    body.push_str(&param);
                }
                if !rendered.is_empty() {
                    body.push('\n');
                    body.push_str(&rendered);
                }
                vec![Activity::action(body)]
            }
            AgentMessage::ResultSuccess(result) => {
                // Avoid posting the final text twice when the last assistant
                // message already carried it.
                let body = if !result.last_text.is_empty()
                    && self.last_response_text.as_deref() != Some(result.last_text.as_str())
                {
                    result.last_text.clone()
                } else {
                    "Session completed.".to_string()
                };
                vec![Activity::response(body).with_signal(ActivitySignal::Stop)]
            }
            AgentMessage::ResultError(result) => {
                let detail = if result.errors.is_empty() {
                    "unknown error".to_string()
                } else {
                    result.errors.join("\n")
                };
                vec![
                    Activity::error(format!("Session failed:\n{detail}"))
                        .with_signal(ActivitySignal::Stop),
                ]
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
