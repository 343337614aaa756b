// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Dispatch primitives: per-repository admission queues, burst merging,
//! and the per-session sink pump.
//!
//! The worker composes these:
//!
//! - [`RepoQueues`] holds CreateSession intents that exceeded the
//!   per-repository concurrency cap, FIFO per repository.
//! - [`BurstBuffer`] merges prompts that arrive within the burst window
//!   into one stream message, preserving attribution.
//! - [`SinkPump`] owns a session's ordered activity delivery: bounded
//!   exponential backoff on sink failure, and collapse of superseded
//!   ephemeral activities while backlogged.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use cyrus_protocol::{Activity, SessionKey};
use cyrus_tracker::ActivitySink;

use crate::router::DispatchIntent;

// ── Per-repository admission queues ───────────────────────────────────────────

/// FIFO of intents waiting for a repository slot.
#[derive(Default)]
pub struct RepoQueues {
    queues: Mutex<HashMap<String, VecDeque<DispatchIntent>>>,
}

impl RepoQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, repository_id: &str, intent: DispatchIntent) {
        debug!(repo = repository_id, "intent queued behind repository cap");
        self.queues
            .lock()
            .expect("repo queue lock")
            .entry(repository_id.to_string())
            .or_default()
            .push_back(intent);
    }

    pub fn pop(&self, repository_id: &str) -> Option<DispatchIntent> {
        self.queues
            .lock()
            .expect("repo queue lock")
            .get_mut(repository_id)
            .and_then(|q| q.pop_front())
    }

    /// Drop every queued intent for a repository (config removal).
    pub fn clear(&self, repository_id: &str) -> usize {
        self.queues
            .lock()
            .expect("repo queue lock")
            .remove(repository_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn depth(&self, repository_id: &str) -> usize {
        self.queues
            .lock()
            .expect("repo queue lock")
            .get(repository_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

// ── Burst merging ─────────────────────────────────────────────────────────────

/// Merges prompts that arrive within one window into a single message.
///
/// The first pusher for a session owns the window: it sleeps for the window
/// duration, then drains everything that accumulated. Later pushers within
/// the window return `None` immediately.
pub struct BurstBuffer {
    window: Duration,
    buffers: Mutex<HashMap<SessionKey, Vec<String>>>,
}

impl BurstBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Add one already-wrapped prompt. Returns the merged message when this
    /// caller owns the window, `None` when the prompt was folded into an
    /// open window.
    pub async fn push(&self, key: &SessionKey, wrapped: String) -> Option<String> {
        let owns_window = {
            let mut buffers = self.buffers.lock().expect("burst lock");
            let buffer = buffers.entry(key.clone()).or_default();
            buffer.push(wrapped);
            buffer.len() == 1
        };
        if !owns_window {
            return None;
        }
        tokio::time::sleep(self.window).await;
        let merged = {
            let mut buffers = self.buffers.lock().expect("burst lock");
            buffers.remove(key).unwrap_or_default()
        };
        debug!(key = %key, merged = merged.len(), "burst window closed");
        Some(merged.join("\n"))
    }

    /// Discard anything buffered for a session (stop/cancel path).
    pub fn discard(&self, key: &SessionKey) -> usize {
        self.buffers
            .lock()
            .expect("burst lock")
            .remove(key)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

// ── Sink pump ─────────────────────────────────────────────────────────────────

struct PumpShared {
    queue: Mutex<VecDeque<Activity>>,
    notify: Notify,
    closed: AtomicBool,
}

/// Ordered delivery of one session's activities with bounded backoff.
pub struct SinkPump {
    shared: Arc<PumpShared>,
    task: tokio::task::JoinHandle<()>,
}

impl SinkPump {
    /// `max_attempts` submissions per activity; backoff doubles from
    /// `base_backoff` and is capped at 30 s.
    pub fn start(sink: Arc<dyn ActivitySink>, max_attempts: u32, base_backoff: Duration) -> Self {
        let shared = Arc::new(PumpShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(Self::drain(shared.clone(), sink, max_attempts, base_backoff));
        Self { shared, task }
    }

    /// Enqueue one activity.
    ///
    /// While a backlog exists, an incoming activity supersedes any ephemeral
    /// activities at the tail: only the newest ephemeral state survives a
    /// sink outage, while every non-ephemeral activity is preserved in
    /// order.
    pub fn enqueue(&self, activity: Activity) {
        {
            let mut queue = self.shared.queue.lock().expect("pump lock");
            while queue.back().map(|a| a.ephemeral).unwrap_or(false) {
                queue.pop_back();
            }
            queue.push_back(activity);
        }
        self.shared.notify.notify_one();
    }

    pub fn backlog(&self) -> usize {
        self.shared.queue.lock().expect("pump lock").len()
    }

    /// Flush the remaining backlog and stop.
    pub async fn close(self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        if let Err(e) = self.task.await {
            warn!("sink pump join error: {e}");
        }
    }

    async fn drain(
        shared: Arc<PumpShared>,
        sink: Arc<dyn ActivitySink>,
        max_attempts: u32,
        base_backoff: Duration,
    ) {
        loop {
            let next = shared.queue.lock().expect("pump lock").pop_front();
            let Some(activity) = next else {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                shared.notify.notified().await;
                continue;
            };

            let mut delivered = false;
            for attempt in 0..max_attempts {
                match sink.submit(activity.clone()).await {
                    Ok(_) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        let backoff = (base_backoff * 2u32.saturating_pow(attempt))
                            .min(Duration::from_secs(30));
                        warn!(
                            attempt = attempt + 1,
                            "sink submission failed, retrying in {backoff:?}: {e}"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            if !delivered {
                // Dropping is deliberate: a sink outage must not wedge the
                // session.
                error!(
                    kind = ?activity.kind,
                    "activity dropped after {max_attempts} failed submissions"
                );
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cyrus_tracker::RecordingSink;

    #[test]
    fn repo_queue_is_fifo() {
        let queues = RepoQueues::new();
        queues.push("r", DispatchIntent::Ignore { reason: "a".into() });
        queues.push("r", DispatchIntent::Ignore { reason: "b".into() });
        assert_eq!(queues.depth("r"), 2);
        assert!(matches!(
            queues.pop("r"),
            Some(DispatchIntent::Ignore { reason }) if reason == "a"
        ));
        assert!(matches!(
            queues.pop("r"),
            Some(DispatchIntent::Ignore { reason }) if reason == "b"
        ));
        assert!(queues.pop("r").is_none());
    }

    #[test]
    fn repo_queue_clear_reports_dropped() {
        let queues = RepoQueues::new();
        queues.push("r", DispatchIntent::Ignore { reason: "a".into() });
        assert_eq!(queues.clear("r"), 1);
        assert_eq!(queues.depth("r"), 0);
    }

    #[tokio::test]
    async fn burst_merges_prompts_within_window() {
        let buffer = Arc::new(BurstBuffer::new(Duration::from_millis(50)));
        let key = SessionKey::new("r", "i");

        let owner = {
            let buffer = buffer.clone();
            let key = key.clone();
            tokio::spawn(async move { buffer.push(&key, "<one>".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(buffer.push(&key, "<two>".into()).await.is_none());

        let merged = owner.await.unwrap().expect("owner delivers");
        assert_eq!(merged, "<one>\n<two>");
    }

    #[tokio::test]
    async fn burst_discard_drops_buffered_prompts() {
        let buffer = Arc::new(BurstBuffer::new(Duration::from_millis(50)));
        let key = SessionKey::new("r", "i");
        let owner = {
            let buffer = buffer.clone();
            let key = key.clone();
            tokio::spawn(async move { buffer.push(&key, "<one>".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(buffer.discard(&key), 1);
        assert!(owner.await.unwrap().expect("owner still returns").is_empty());
    }

    #[tokio::test]
    async fn pump_delivers_in_order() {
        let sink = Arc::new(RecordingSink::new());
        let pump = SinkPump::start(sink.clone(), 3, Duration::from_millis(1));
        pump.enqueue(Activity::thought("a"));
        pump.enqueue(Activity::response("b"));
        pump.close().await;

        let visible = sink.visible();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].body, "a");
        assert_eq!(visible[1].body, "b");
        assert!(visible[0].order_seq < visible[1].order_seq);
    }

    #[tokio::test]
    async fn pump_retries_then_recovers() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail_next(2);
        let pump = SinkPump::start(sink.clone(), 5, Duration::from_millis(1));
        pump.enqueue(Activity::response("persistent"));
        pump.close().await;
        assert_eq!(sink.visible().len(), 1);
    }

    #[tokio::test]
    async fn pump_drops_after_budget_and_continues() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail_next(10);
        let pump = SinkPump::start(sink.clone(), 2, Duration::from_millis(1));
        pump.enqueue(Activity::response("lost"));
        pump.enqueue(Activity::response("kept"));
        pump.close().await;

        let visible = sink.visible();
        assert_eq!(visible.len(), 1, "first dropped after budget, second kept");
        assert_eq!(visible[0].body, "kept");
    }

    #[tokio::test]
    async fn backlogged_ephemerals_collapse_to_newest() {
        let sink = Arc::new(RecordingSink::new());
        // Stall delivery long enough to build a backlog.
        sink.fail_next(3);
        let pump = SinkPump::start(sink.clone(), 10, Duration::from_millis(20));
        pump.enqueue(Activity::action("step 1").ephemeral());
        pump.enqueue(Activity::action("step 2").ephemeral());
        pump.enqueue(Activity::action("step 3").ephemeral());
        pump.enqueue(Activity::response("final"));
        pump.close().await;

        // "step 1" was already in flight when the backlog built, but the
        // superseded "step 2"/"step 3" never reached the sink.
        let submitted = sink.submitted();
        assert!(submitted.iter().all(|a| a.body != "step 2"));
        assert!(submitted.iter().all(|a| a.body != "step 3"));
        let visible = sink.visible();
        assert_eq!(visible.last().unwrap().body, "final");
        assert_eq!(visible.len(), 1, "ephemeral step replaced by the response");
    }
}
