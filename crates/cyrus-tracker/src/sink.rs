// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Activity delivery with ordering and ephemerality.
//!
//! A sink owns the surface-side state of one session: the monotonic order
//! sequence (assigned at submission, not at runner emission) and the id of
//! the currently pending ephemeral activity. The next submission — ephemeral
//! or not — replaces a pending ephemeral activity instead of appending.
//!
//! Sink failures are non-fatal for the session: the dispatcher retries with
//! backoff and eventually drops the activity.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use cyrus_protocol::Activity;

use crate::client::{IssueTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("sink is closed")]
    Closed,
}

/// Ordered, optionally ephemeral delivery of activities for one session.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Submit one activity. Returns the order sequence it was assigned.
    async fn submit(&self, activity: Activity) -> Result<u64, SinkError>;

    /// Upload a file and return the URL to reference in a later activity.
    async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, SinkError>;
}

struct TrackerSinkState {
    next_seq: u64,
    /// Activity id of the pending ephemeral post, replaced by the next
    /// submission.
    pending_ephemeral: Option<String>,
}

/// Sink that posts into one tracker agent session.
pub struct TrackerSink {
    tracker: Arc<dyn IssueTracker>,
    agent_session_id: String,
    state: Mutex<TrackerSinkState>,
}

impl TrackerSink {
    pub fn new(tracker: Arc<dyn IssueTracker>, agent_session_id: impl Into<String>) -> Self {
        Self {
            tracker,
            agent_session_id: agent_session_id.into(),
            state: Mutex::new(TrackerSinkState {
                next_seq: 0,
                pending_ephemeral: None,
            }),
        }
    }
}

#[async_trait]
impl ActivitySink for TrackerSink {
    async fn submit(&self, mut activity: Activity) -> Result<u64, SinkError> {
        // One submission at a time per session: the lock is the ordering
        // guarantee.
        let mut state = self.state.lock().await;
        activity.order_seq = state.next_seq;

        let posted_id = match state.pending_ephemeral.take() {
            Some(prev_id) => {
                debug!(prev = %prev_id, "replacing ephemeral activity");
                self.tracker
                    .replace_activity(&self.agent_session_id, &prev_id, &activity)
                    .await?
            }
            None => {
                self.tracker
                    .post_activity(&self.agent_session_id, &activity)
                    .await?
            }
        };
        if activity.ephemeral {
            state.pending_ephemeral = Some(posted_id);
        }
        state.next_seq += 1;
        Ok(activity.order_seq)
    }

    async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, SinkError> {
        Ok(self
            .tracker
            .upload_attachment(filename, content_type, data)
            .await?)
    }
}

// ── Recording sink (tests) ────────────────────────────────────────────────────

/// In-memory sink that records submissions and can inject failures.
///
/// Replicates the tracker sink's ephemeral-replacement bookkeeping so tests
/// can assert on the surface-visible activity list.
#[derive(Default)]
pub struct RecordingSink {
    state: std::sync::Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    /// What the surface would show: ephemeral entries get replaced.
    visible: Vec<Activity>,
    /// Every submission in order, including replaced ephemerals.
    submitted: Vec<Activity>,
    next_seq: u64,
    pending_ephemeral_idx: Option<usize>,
    fail_next: u32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` submissions fail.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().expect("lock").fail_next = n;
    }

    /// The activities a human would currently see, in order.
    pub fn visible(&self) -> Vec<Activity> {
        self.state.lock().expect("lock").visible.clone()
    }

    /// Every accepted submission, including since-replaced ephemerals.
    pub fn submitted(&self) -> Vec<Activity> {
        self.state.lock().expect("lock").submitted.clone()
    }
}

#[async_trait]
impl ActivitySink for RecordingSink {
    async fn submit(&self, mut activity: Activity) -> Result<u64, SinkError> {
        let mut state = self.state.lock().expect("lock");
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SinkError::Tracker(TrackerError::Api(
                "injected failure".into(),
            )));
        }
        activity.order_seq = state.next_seq;
        state.next_seq += 1;
        state.submitted.push(activity.clone());

        match state.pending_ephemeral_idx.take() {
            Some(idx) => state.visible[idx] = activity.clone(),
            None => state.visible.push(activity.clone()),
        }
        if activity.ephemeral {
            state.pending_ephemeral_idx = Some(state.visible.len() - 1);
        }
        Ok(activity.order_seq)
    }

    async fn upload(
        &self,
        filename: &str,
        _content_type: &str,
        _data: Vec<u8>,
    ) -> Result<String, SinkError> {
        Ok(format!("https://files.test/{filename}"))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cyrus_protocol::ActivityKind;

    #[tokio::test]
    async fn order_seq_is_monotonic_per_submission() {
        let sink = RecordingSink::new();
        let a = sink.submit(Activity::thought("a")).await.unwrap();
        let b = sink.submit(Activity::response("b")).await.unwrap();
        assert_eq!((a, b), (0, 1));
        let submitted = sink.submitted();
        assert_eq!(submitted[0].order_seq, 0);
        assert_eq!(submitted[1].order_seq, 1);
    }

    #[tokio::test]
    async fn ephemeral_is_replaced_by_next_activity() {
        let sink = RecordingSink::new();
        sink.submit(Activity::action("Reading `a.rs`").ephemeral())
            .await
            .unwrap();
        sink.submit(Activity::action("read 10 lines")).await.unwrap();

        let visible = sink.visible();
        assert_eq!(visible.len(), 1, "ephemeral replaced, not appended");
        assert_eq!(visible[0].body, "read 10 lines");
        assert_eq!(sink.submitted().len(), 2, "both submissions recorded");
    }

    #[tokio::test]
    async fn consecutive_ephemerals_collapse() {
        let sink = RecordingSink::new();
        sink.submit(Activity::action("step 1").ephemeral()).await.unwrap();
        sink.submit(Activity::action("step 2").ephemeral()).await.unwrap();
        sink.submit(Activity::response("done")).await.unwrap();

        let visible = sink.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].body, "done");
    }

    #[tokio::test]
    async fn non_ephemeral_activities_append() {
        let sink = RecordingSink::new();
        sink.submit(Activity::thought("thinking")).await.unwrap();
        sink.submit(Activity::response("answer")).await.unwrap();
        assert_eq!(sink.visible().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_do_not_advance_seq() {
        let sink = RecordingSink::new();
        sink.fail_next(1);
        assert!(sink.submit(Activity::thought("lost")).await.is_err());
        let seq = sink.submit(Activity::thought("kept")).await.unwrap();
        assert_eq!(seq, 0, "failed submission must not consume a sequence");
    }

    #[tokio::test]
    async fn error_kind_round_trips_through_sink() {
        let sink = RecordingSink::new();
        sink.submit(Activity::error("boom")).await.unwrap();
        assert_eq!(sink.visible()[0].kind, ActivityKind::Error);
    }
}
