// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session identity and lifecycle state.
//!
//! A session binds one agent interaction to one issue/thread. Runners and
//! sinks never hold references to session records; they hold a [`SessionKey`]
//! and go through the registry, which keeps the object graph acyclic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a session: one per `(repository, issue, thread)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub repository_id: String,
    pub issue_id: String,
    /// Distinguishes parallel threads on the same issue. Empty for the
    /// issue's root thread.
    #[serde(default)]
    pub thread_id: String,
}

impl SessionKey {
    pub fn new(repository_id: impl Into<String>, issue_id: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            issue_id: issue_id.into(),
            thread_id: String::new(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.thread_id.is_empty() {
            write!(f, "{}/{}", self.repository_id, self.issue_id)
        } else {
            write!(f, "{}/{}#{}", self.repository_id, self.issue_id, self.thread_id)
        }
    }
}

/// Lifecycle state of a session.
///
/// ```text
/// Pending ──sessionId──► Active ──result.success──► Completed
///    │                     │  │────result.error───► Failed
///    │                     └──────────stop()──────► Stopped
///    └──spawn error──────────────────────────────► Failed
/// ```
///
/// `AwaitingInput` is a sub-state of Active used when the agent elicits a
/// human answer; a follow-up prompt returns it to Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, subprocess spawning, no provider session id yet.
    Pending,
    /// Runner live and processing.
    Active,
    /// Runner live, blocked on a human answer.
    AwaitingInput,
    /// Terminal: provider reported success.
    Completed,
    /// Terminal: provider or supervisor reported failure.
    Failed,
    /// Terminal: stopped by an operator or a config change.
    Stopped,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Stopped
        )
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

/// Read-only summary of a session, returned by the registry and the admin
/// session list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    /// Provider session token; `None` until the first `system.init`.
    pub provider_session_id: Option<String>,
    pub state: SessionState,
    pub runner_kind: String,
    pub workspace_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: usize,
    pub queued_prompts: usize,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
