// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The canonical agent message stream.
//!
//! Every runner adapter — whatever its provider's native protocol looks like
//! — normalises into this vocabulary:
//!
//! ```text
//! system.init                    (exactly one, always first; synthesised
//!                                 by the supervisor if the provider omits it)
//! user | assistant | tool_result (zero or more, in provider order)
//! result.success | result.error  (exactly one, always last)
//! ```
//!
//! Invariants the supervisor enforces:
//! - consecutive same-role deltas are accumulated into one message;
//! - every `tool_use` id is unique within a session and is paired with
//!   exactly one `tool_result` before the terminal `result.*`;
//! - `result.*` is terminal — nothing is emitted after it.

use serde::{Deserialize, Serialize};

/// Token accounting reported by (or reconstructed for) a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

/// An MCP server the provider reported at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerInfo {
    pub name: String,
    pub status: String,
}

/// Session bootstrap information. First message of every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInit {
    /// Provider session token. Opaque; used to resume.
    pub session_id: String,
    pub cwd: String,
    pub tools: Vec<String>,
    pub model: String,
    pub permission_mode: String,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerInfo>,
}

/// User-side message content: plain text or provider-structured blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl UserContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            UserContent::Text(t) => Some(t),
            UserContent::Blocks(_) => None,
        }
    }
}

/// One structured tool invocation inside an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A block of assistant output: either prose or a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    ToolUse(ToolUse),
}

/// Successful terminal result of a session turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSuccess {
    pub duration_ms: u64,
    #[serde(default)]
    pub usage: Usage,
    /// The final assistant text, for surfaces that only show the last reply.
    pub last_text: String,
}

/// Failed terminal result. `errors` carries provider-specific messages plus
/// anything the supervisor reconstructed from stderr/exit status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub duration_ms: u64,
    pub errors: Vec<String>,
    #[serde(default)]
    pub usage: Usage,
}

/// One canonical message in a runner's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    #[serde(rename = "system.init")]
    SystemInit(SystemInit),
    User {
        content: UserContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    Assistant {
        content: Vec<AssistantBlock>,
        model: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "result.success")]
    ResultSuccess(ResultSuccess),
    #[serde(rename = "result.error")]
    ResultError(ResultError),
}

impl AgentMessage {
    /// Terminal messages end the session; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentMessage::ResultSuccess(_) | AgentMessage::ResultError(_)
        )
    }

    /// The last prose text inside an assistant message, if any.
    pub fn assistant_text(&self) -> Option<&str> {
        match self {
            AgentMessage::Assistant { content, .. } => {
                content.iter().rev().find_map(|b| match b {
                    AssistantBlock::Text { text } => Some(text.as_str()),
                    AssistantBlock::ToolUse(_) => None,
                })
            }
            _ => None,
        }
    }

    /// Tool uses contained in this message (empty for non-assistant messages).
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        match self {
            AgentMessage::Assistant { content, .. } => content
                .iter()
                .filter_map(|b| match b {
                    AssistantBlock::ToolUse(t) => Some(t),
                    AssistantBlock::Text { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_init_tag_is_dotted() {
        let msg = AgentMessage::SystemInit(SystemInit {
            session_id: "s1".into(),
            cwd: "/work".into(),
            tools: vec!["Read".into()],
            model: "m".into(),
            permission_mode: "default".into(),
            mcp_servers: vec![],
        });
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "system.init");
    }

    #[test]
    fn result_messages_are_terminal() {
        assert!(AgentMessage::ResultSuccess(ResultSuccess::default()).is_terminal());
        assert!(AgentMessage::ResultError(ResultError::default()).is_terminal());
        assert!(!AgentMessage::User {
            content: UserContent::Text("hi".into()),
            parent_tool_use_id: None,
        }
        .is_terminal());
    }

    #[test]
    fn assistant_text_returns_last_text_block() {
        let msg = AgentMessage::Assistant {
            content: vec![
                AssistantBlock::Text { text: "first".into() },
                AssistantBlock::ToolUse(ToolUse {
                    id: "t1".into(),
                    name: "Read".into(),
                    input: json!({"path": "x"}),
                }),
                AssistantBlock::Text { text: "last".into() },
            ],
            model: "m".into(),
        };
        assert_eq!(msg.assistant_text(), Some("last"));
        assert_eq!(msg.tool_uses().len(), 1);
    }

    #[test]
    fn tool_result_round_trip() {
        let msg = AgentMessage::ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn user_content_accepts_plain_string() {
        let back: AgentMessage =
            serde_json::from_value(json!({"type": "user", "content": "hello"})).unwrap();
        match back {
            AgentMessage::User { content, .. } => {
                assert_eq!(content.as_text(), Some("hello"));
            }
            other => panic!("expected user, got {other:?}"),
        }
    }
}
