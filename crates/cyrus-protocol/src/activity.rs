// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Activities — the human-visible units a sink posts back to a surface.

use serde::{Deserialize, Serialize};

/// The tracker-side classification of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Internal reasoning the agent chose to surface.
    Thought,
    /// A tool call in progress or completed.
    Action,
    /// A prose reply addressed to the humans on the thread.
    Response,
    /// Something went wrong; the session may or may not continue.
    Error,
    /// The agent is waiting for a human answer.
    Elicitation,
}

/// Out-of-band signal attached to an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    /// The session ended (terminal result delivered).
    Stop,
    /// The agent paused and needs human input before continuing.
    AwaitingInput,
}

/// One unit of surface output.
///
/// `order_seq` is assigned by the sink at submission time — not when the
/// runner emitted the underlying message — so within a session activities
/// carry a strictly increasing sequence regardless of upstream timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityKind,
    /// Markdown body.
    pub body: String,
    /// Ephemeral activities are replaced, not appended, by the session's next
    /// non-ephemeral activity.
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<ActivitySignal>,
    /// The surface comment that triggered this activity, when replying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_comment_id: Option<String>,
    /// Monotonic per-session sequence, assigned at sink submission.
    #[serde(default)]
    pub order_seq: u64,
}

impl Activity {
    pub fn new(kind: ActivityKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
            ephemeral: false,
            signal: None,
            source_comment_id: None,
            order_seq: 0,
        }
    }

    pub fn thought(body: impl Into<String>) -> Self {
        Self::new(ActivityKind::Thought, body)
    }

    pub fn action(body: impl Into<String>) -> Self {
        Self::new(ActivityKind::Action, body)
    }

    pub fn response(body: impl Into<String>) -> Self {
        Self::new(ActivityKind::Response, body)
    }

    pub fn error(body: impl Into<String>) -> Self {
        Self::new(ActivityKind::Error, body)
    }

    pub fn elicitation(body: impl Into<String>) -> Self {
        Self::new(ActivityKind::Elicitation, body)
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn with_signal(mut self, signal: ActivitySignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_kind_and_flags() {
        let a = Activity::action("Reading `src/main.rs`").ephemeral();
        assert_eq!(a.kind, ActivityKind::Action);
        assert!(a.ephemeral);
        assert!(a.signal.is_none());
    }

    #[test]
    fn signal_round_trips() {
        let a = Activity::response("done").with_signal(ActivitySignal::Stop);
        let json = serde_json::to_string(&a).unwrap();
        let back: Activity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.signal, Some(ActivitySignal::Stop));
    }
}
