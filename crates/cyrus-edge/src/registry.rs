// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session arena.
//!
//! One record per `(repository, issue, thread)`. All mutation goes through
//! the registry's lock, which serialises writes per the single-writer
//! discipline; readers receive snapshots or cloned handles, never
//! references into the arena.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use cyrus_protocol::{SessionKey, SessionSnapshot, SessionState};
use cyrus_runner::AgentRunner;
use cyrus_tracker::ActivitySink;

/// One live (or terminal, not-yet-freed) session.
pub struct SessionRecord {
    pub key: SessionKey,
    pub provider_session_id: Option<String>,
    pub state: SessionState,
    pub runner_kind: String,
    pub workspace_path: PathBuf,
    pub runner: Arc<dyn AgentRunner>,
    pub sink: Arc<dyn ActivitySink>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: usize,
    /// Prompts waiting for the current agent turn to finish (non-streaming
    /// runners only; streaming runners receive prompts inline).
    pub pending_prompts: VecDeque<String>,
    pub supports_streaming: bool,
    /// Spawn attempts consumed by the retry budget.
    pub spawn_attempts: u32,
}

impl SessionRecord {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            provider_session_id: self.provider_session_id.clone(),
            state: self.state,
            runner_kind: self.runner_kind.clone(),
            workspace_path: self.workspace_path.display().to_string(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            message_count: self.message_count,
            queued_prompts: self.pending_prompts.len(),
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SessionRecord) {
        debug!(key = %record.key, "session registered");
        self.sessions
            .lock()
            .expect("registry lock")
            .insert(record.key.clone(), record);
    }

    /// Run `f` against the record for `key`, if present.
    pub fn with_session<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Option<R> {
        self.sessions
            .lock()
            .expect("registry lock")
            .get_mut(key)
            .map(f)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.lock().expect("registry lock").contains_key(key)
    }

    /// Whether `key` refers to a session in a non-terminal state.
    pub fn is_live(&self, key: &SessionKey) -> bool {
        self.with_session(key, |s| s.state.is_live()).unwrap_or(false)
    }

    pub fn runner(&self, key: &SessionKey) -> Option<Arc<dyn AgentRunner>> {
        self.with_session(key, |s| s.runner.clone())
    }

    pub fn sink(&self, key: &SessionKey) -> Option<Arc<dyn ActivitySink>> {
        self.with_session(key, |s| s.sink.clone())
    }

    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        self.with_session(key, |s| s.state)
    }

    pub fn set_state(&self, key: &SessionKey, state: SessionState) {
        self.with_session(key, |s| {
            debug!(key = %s.key, ?state, "session state change");
            s.state = state;
            s.last_activity_at = Utc::now();
        });
    }

    pub fn remove(&self, key: &SessionKey) -> Option<SessionRecord> {
        debug!(key = %key, "session freed");
        self.sessions.lock().expect("registry lock").remove(key)
    }

    /// Number of live sessions bound to a repository.
    pub fn live_count_for_repo(&self, repository_id: &str) -> usize {
        self.sessions
            .lock()
            .expect("registry lock")
            .values()
            .filter(|s| s.key.repository_id == repository_id && s.state.is_live())
            .count()
    }

    /// Keys of every session (any state) bound to a repository.
    pub fn keys_for_repo(&self, repository_id: &str) -> Vec<SessionKey> {
        self.sessions
            .lock()
            .expect("registry lock")
            .keys()
            .filter(|k| k.repository_id == repository_id)
            .cloned()
            .collect()
    }

    /// Find the session for an issue, preferring an exact thread match and
    /// falling back to the issue's root thread.
    pub fn find_for_issue(
        &self,
        repository_id: &str,
        issue_id: &str,
        thread_id: &str,
    ) -> Option<SessionKey> {
        let sessions = self.sessions.lock().expect("registry lock");
        let exact = SessionKey {
            repository_id: repository_id.to_string(),
            issue_id: issue_id.to_string(),
            thread_id: thread_id.to_string(),
        };
        if sessions.contains_key(&exact) {
            return Some(exact);
        }
        let root = SessionKey::new(repository_id, issue_id);
        sessions.contains_key(&root).then_some(root)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions
            .lock()
            .expect("registry lock")
            .values()
            .map(|s| s.snapshot())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
