// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Normalised inbound events.
//!
//! Each transport adapter parses its surface's webhook payload, verifies the
//! request, and emits exactly one [`InboundEvent`]. Everything downstream
//! (router, dispatcher, session registry) is surface-agnostic and sees only
//! this shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which transport produced an event. Part of the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Issue-tracker webhook (assignments, comments, unassignments).
    Tracker,
    /// Chat-surface mention or thread reply.
    Chat,
    /// Code-host issue/PR comment.
    CodeHost,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Tracker => "tracker",
            TransportKind::Chat => "chat",
            TransportKind::CodeHost => "code_host",
        };
        f.write_str(s)
    }
}

/// What kind of human activity the payload described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new assignment or mention that should start a fresh session.
    NewThread,
    /// A reply on a thread that may already have a live session.
    Reply,
    /// An @-mention inside an existing thread.
    Mention,
    /// The agent was unassigned from the issue.
    Unassign,
    /// An explicit stop request (slash command, thread deletion).
    Stop,
    /// Anything the transport recognised but the worker should not act on.
    Ignore,
}

/// Identifiers locating the originating surface object (channel, thread,
/// comment). Opaque to the router; threaded through to the activity sink so
/// replies land in the right place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceRefs {
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub comment_id: Option<String>,
}

/// Issue-tracker coordinates carried by tracker events (and by chat events
/// that reference an issue).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRefs {
    pub issue_id: String,
    /// Human-readable key, e.g. `ENG-42`. Used in workspace paths.
    pub issue_key: String,
    pub team_key: Option<String>,
    pub labels: Vec<String>,
}

/// A file attached to the triggering comment or message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
}

/// A surface event after verification and normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub transport: TransportKind,
    /// Upstream delivery id. `(transport, envelope_id)` is the dedup key;
    /// upstream retries reuse it.
    pub envelope_id: String,
    pub kind: EventKind,
    /// Display name of the human who triggered the event.
    pub author: String,
    /// Message/comment body, markdown.
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub surface: SurfaceRefs,
    pub occurred_at: DateTime<Utc>,
    /// Present for tracker events and for chat events bound to an issue.
    pub issue: Option<IssueRefs>,
}

impl InboundEvent {
    /// The dedup key for the router's sliding window.
    pub fn dedup_key(&self) -> (TransportKind, String) {
        (self.transport, self.envelope_id.clone())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_round_trip() {
        let ev = InboundEvent {
            transport: TransportKind::Tracker,
            envelope_id: "env-1".into(),
            kind: EventKind::NewThread,
            author: "alice".into(),
            content: "please fix".into(),
            attachments: vec![],
            surface: SurfaceRefs::default(),
            occurred_at: Utc::now(),
            issue: Some(IssueRefs {
                issue_id: "iss-1".into(),
                issue_key: "ENG-1".into(),
                team_key: Some("ENG".into()),
                labels: vec!["Bug".into()],
            }),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: InboundEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.envelope_id, "env-1");
        assert_eq!(back.kind, EventKind::NewThread);
        assert_eq!(back.issue.unwrap().issue_key, "ENG-1");
    }

    #[test]
    fn transport_kind_serializes_as_snake_case() {
        let s = serde_json::to_string(&TransportKind::CodeHost).unwrap();
        assert_eq!(s, "\"code_host\"");
    }

    #[test]
    fn dedup_key_pairs_transport_and_envelope() {
        let ev = InboundEvent {
            transport: TransportKind::Chat,
            envelope_id: "abc".into(),
            kind: EventKind::Reply,
            author: "bob".into(),
            content: String::new(),
            attachments: vec![],
            surface: SurfaceRefs::default(),
            occurred_at: Utc::now(),
            issue: None,
        };
        assert_eq!(ev.dedup_key(), (TransportKind::Chat, "abc".to_string()));
    }
}
