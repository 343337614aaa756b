// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end worker scenarios: inbound events in, surface activities out,
//! with scripted runners and recording sinks standing in for the provider
//! CLI and the tracker API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use cyrus_config::{ConfigManager, ConfigStore, PromptRule, Repository};
use cyrus_edge::{EdgeWorker, EdgeWorkerOptions, RunnerRequest, WorkspaceManager};
use cyrus_protocol::{
    ActivityKind, AgentMessage, AssistantBlock, EventKind, InboundEvent, IssueRefs, ResultError,
    ResultSuccess, SessionKey, SessionState, SurfaceRefs, SystemInit, ToolUse, TransportKind,
};
use cyrus_runner::{RunnerKind, ScriptedRunner};
use cyrus_tracker::RecordingSink;

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    config: Arc<ConfigManager>,
    worker: Arc<EdgeWorker>,
    events: mpsc::Sender<InboundEvent>,
    runners: Arc<Mutex<Vec<(RunnerRequest, Arc<ScriptedRunner>)>>>,
    sinks: Arc<Mutex<Vec<(SessionKey, Arc<RecordingSink>)>>>,
    _dir: tempfile::TempDir,
}

fn init_msg(session_id: &str) -> AgentMessage {
    AgentMessage::SystemInit(SystemInit {
        session_id: session_id.into(),
        cwd: "/ws".into(),
        tools: vec!["Read".into()],
        model: "scripted".into(),
        permission_mode: "default".into(),
        mcp_servers: vec![],
    })
}

impl Harness {
    /// Build a worker over one repository, with scripted runners handed out
    /// in order from `scripts` (later sessions reuse the last script).
    async fn start(
        runner_kind: RunnerKind,
        scripts: Vec<Vec<AgentMessage>>,
        configure: impl FnOnce(&ConfigManager),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("repo-A")).unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();

        let store = ConfigStore::new(dir.path().join("config.json"), 3);
        let config = Arc::new(ConfigManager::new(store).unwrap());
        config
            .add_repository(Repository {
                id: "repo-A".into(),
                name: "Repo A".into(),
                repository_path: dir.path().join("repo-A").display().to_string(),
                base_branch: "main".into(),
                linear_workspace_id: "ws-1".into(),
                linear_token: "lin_tok".into(),
                team_keys: vec!["ENG".into()],
                ..Repository::default()
            })
            .unwrap();
        config
            .update(serde_json::json!({"worker": {"burstWindowMs": 40}}))
            .unwrap();
        configure(&config);

        let runners: Arc<Mutex<Vec<(RunnerRequest, Arc<ScriptedRunner>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sinks: Arc<Mutex<Vec<(SessionKey, Arc<RecordingSink>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let script_queue = Arc::new(Mutex::new(scripts.into_iter().collect::<VecDeque<_>>()));

        let runner_factory = {
            let runners = runners.clone();
            let script_queue = script_queue.clone();
            Arc::new(move |request: &RunnerRequest| {
                let script = {
                    let mut q = script_queue.lock().unwrap();
                    if q.len() > 1 {
                        q.pop_front().unwrap()
                    } else {
                        q.front().cloned().unwrap_or_else(|| vec![init_msg("s")])
                    }
                };
                let runner = Arc::new(ScriptedRunner::with_script(request.kind, script));
                runners.lock().unwrap().push((request.clone(), runner.clone()));
                runner as Arc<dyn cyrus_runner::AgentRunner>
            })
        };

        let sink_factory = {
            let sinks = sinks.clone();
            Arc::new(
                move |key: &SessionKey, _event: &InboundEvent| -> futures::future::BoxFuture<
                    'static,
                    anyhow::Result<Arc<dyn cyrus_tracker::ActivitySink>>,
                > {
                    let sink = Arc::new(RecordingSink::new());
                    sinks.lock().unwrap().push((key.clone(), sink.clone()));
                    Box::pin(async move { Ok(sink as Arc<dyn cyrus_tracker::ActivitySink>) })
                },
            )
        };

        let worker = EdgeWorker::new(EdgeWorkerOptions {
            config: config.clone(),
            runner_factory,
            sink_factory,
            runner_kind,
            workspaces: WorkspaceManager::new(false),
            prompts_dir: dir.path().join("prompts"),
            log_dir: dir.path().join("logs"),
            tracker: None,
        });

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(worker.clone().run(rx));
        // Let the worker subscribe to config events before the test mutates.
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            config,
            worker,
            events: tx,
            runners,
            sinks,
            _dir: dir,
        }
    }

    async fn send(&self, event: InboundEvent) {
        self.events.send(event).await.unwrap();
    }

    fn runner(&self, index: usize) -> Arc<ScriptedRunner> {
        self.runners.lock().unwrap()[index].1.clone()
    }

    fn request(&self, index: usize) -> RunnerRequest {
        self.runners.lock().unwrap()[index].0.clone()
    }

    fn runner_count(&self) -> usize {
        self.runners.lock().unwrap().len()
    }

    fn sink(&self, index: usize) -> Arc<RecordingSink> {
        self.sinks.lock().unwrap()[index].1.clone()
    }

    async fn wait_for(&self, what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }
}

fn assign_event(issue_id: &str, envelope: &str, labels: &[&str]) -> InboundEvent {
    InboundEvent {
        transport: TransportKind::Tracker,
        envelope_id: envelope.into(),
        kind: EventKind::NewThread,
        author: "alice".into(),
        content: "please handle this".into(),
        attachments: vec![],
        surface: SurfaceRefs::default(),
        occurred_at: Utc::now(),
        issue: Some(IssueRefs {
            issue_id: issue_id.into(),
            issue_key: issue_id.into(),
            team_key: Some("ENG".into()),
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

fn reply_event(issue_id: &str, envelope: &str, author: &str, text: &str) -> InboundEvent {
    let mut ev = assign_event(issue_id, envelope, &[]);
    ev.kind = EventKind::Reply;
    ev.author = author.into();
    ev.content = text.into();
    ev
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn assignment_creates_a_session() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("sess-1")]], |_| {}).await;

    h.send(assign_event("T-1", "env-1", &[])).await;

    let key = SessionKey::new("repo-A", "T-1");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;

    // The fallback prompt was rendered with the issue wrapper.
    let prompt = h.runner(0).started_prompts()[0].clone();
    assert!(prompt.contains("<linear_issue id=\"T-1\""));
    assert!(prompt.contains("User comment: (alice) please handle this"));

    // Routed with the repository's default tool list and fallback prompt.
    let request = h.request(0);
    assert_eq!(request.prompt_type, "fallback");
    assert!(request.allowed_tools.contains(&"Read".to_string()));
    assert!(request.allowed_tools.contains(&"Edit".to_string()));

    // The init made it to the surface.
    let sink = h.sink(0);
    h.wait_for("init activity", || !sink.submitted().is_empty()).await;
    assert_eq!(sink.submitted()[0].kind, ActivityKind::Thought);

    // The provider session id was recorded.
    let snap = registry.snapshots().into_iter().next().unwrap();
    assert_eq!(snap.provider_session_id.as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn label_routes_to_builder_prompt() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |config| {
        let mut repo = config.get().repository("repo-A").unwrap().clone();
        repo.label_prompts.insert(
            "builder".into(),
            PromptRule {
                labels: vec!["feature".into()],
                prompt_path: Some("custom-builder.md".into()),
                ..PromptRule::default()
            },
        );
        config.update_repository(repo).unwrap();
    })
    .await;
    std::fs::write(
        h._dir.path().join("prompts/custom-builder.md"),
        "You are the builder for this repository.",
    )
    .unwrap();

    h.send(assign_event("T-2", "env-2", &["Feature"])).await;

    h.wait_for("runner created", || h.runner_count() == 1).await;
    let request = h.request(0);
    assert_eq!(request.prompt_name, "builder");
    assert_eq!(request.prompt_type, "label-based");
    assert_eq!(
        request.system_prompt.as_deref(),
        Some("You are the builder for this repository.")
    );

    let prompt = h.runner(0).started_prompts()[0].clone();
    assert!(prompt.contains("identifier=\"T-2\""));
    assert!(prompt.contains("User comment:"));
}

#[tokio::test]
async fn duplicate_webhook_is_deduplicated() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |_| {}).await;

    let event = assign_event("T-3", "env-dup", &[]);
    h.send(event.clone()).await;
    h.send(event).await;

    let registry = h.worker.registry();
    h.wait_for("one session", || registry.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.runner_count(), 1, "second delivery produced no dispatch");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn streaming_runner_receives_wrapped_follow_up() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |_| {}).await;

    h.send(assign_event("T-4", "env-4", &[])).await;
    let key = SessionKey::new("repo-A", "T-4");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;

    h.send(reply_event("T-4", "env-5", "bob", "any update?")).await;

    let runner = h.runner(0);
    h.wait_for("stream message", || !runner.stream_inputs().is_empty()).await;
    let delivered = runner.stream_inputs()[0].clone();
    assert!(delivered.starts_with("<new_comment><author>bob</author><timestamp>"));
    assert!(delivered.ends_with("<content>any update?</content></new_comment>"));
    assert_eq!(h.runner_count(), 1, "no second session was created");
}

#[tokio::test]
async fn burst_of_replies_is_merged_into_one_message() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |_| {}).await;

    h.send(assign_event("T-5", "env-6", &[])).await;
    let key = SessionKey::new("repo-A", "T-5");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;

    h.send(reply_event("T-5", "env-7", "bob", "first")).await;
    h.send(reply_event("T-5", "env-8", "carol", "second")).await;

    let runner = h.runner(0);
    h.wait_for("merged delivery", || !runner.stream_inputs().is_empty()).await;
    let inputs = runner.stream_inputs();
    assert_eq!(inputs.len(), 1, "burst merged into one stream message");
    assert!(inputs[0].contains("<author>bob</author>"));
    assert!(inputs[0].contains("<author>carol</author>"));
    let first_idx = inputs[0].find("first").unwrap();
    let second_idx = inputs[0].find("second").unwrap();
    assert!(first_idx < second_idx, "attribution order preserved");
}

#[tokio::test]
async fn config_reload_removing_repository_stops_its_session() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |_| {}).await;

    h.send(assign_event("T-6", "env-9", &[])).await;
    let key = SessionKey::new("repo-A", "T-6");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;
    let runner = h.runner(0);
    let sink = h.sink(0);

    h.config.remove_repository("repo-A").unwrap();

    h.wait_for("session freed", || registry.is_empty()).await;
    assert!(runner.was_stopped(), "runner received stop()");
    let submitted = sink.submitted();
    assert!(
        submitted
            .iter()
            .any(|a| a.kind == ActivityKind::Error && a.body.contains("repository_removed")),
        "terminal error activity posted with reason repository_removed"
    );
}

#[tokio::test]
async fn runner_crash_mid_tool_call_yields_single_error_activity() {
    let script = vec![
        init_msg("s"),
        AgentMessage::Assistant {
            content: vec![AssistantBlock::ToolUse(ToolUse {
                id: "t1".into(),
                name: "Bash".into(),
                input: serde_json::json!({"command": "cargo test"}),
            })],
            model: "m".into(),
        },
    ];
    let h = Harness::start(RunnerKind::Claude, vec![script], |_| {}).await;

    h.send(assign_event("T-7", "env-10", &[])).await;
    let key = SessionKey::new("repo-A", "T-7");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;

    // The supervisor's crash handling: a synthetic error result for the
    // outstanding tool call, then a synthesised terminal error.
    let runner = h.runner(0);
    runner.emit(AgentMessage::ToolResult {
        tool_use_id: "t1".into(),
        content: "Bash did not complete before the session ended".into(),
        is_error: true,
    });
    runner.emit(AgentMessage::ResultError(ResultError {
        duration_ms: 42,
        errors: vec!["process exited with code 137".into()],
        usage: Default::default(),
    }));

    h.wait_for("session failed", || {
        registry.state(&key) == Some(SessionState::Failed)
    })
    .await;

    let sink = h.sink(0);
    h.wait_for("error activity", || {
        sink.visible().iter().any(|a| a.kind == ActivityKind::Error)
    })
    .await;
    let visible = sink.visible();
    let errors: Vec<_> = visible
        .iter()
        .filter(|a| a.kind == ActivityKind::Error)
        .collect();
    assert_eq!(errors.len(), 1, "exactly one error activity");
    assert!(errors[0].body.contains("code 137"));
    assert!(
        visible.iter().all(|a| !a.ephemeral),
        "no orphan ephemeral activity remains"
    );
    // The paired error result replaced the pending tool action.
    assert!(visible
        .iter()
        .any(|a| a.kind == ActivityKind::Action && a.body.contains("did not complete")));
}

// ── Invariants ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn activities_are_delivered_in_submission_order() {
    let script = vec![
        init_msg("s"),
        AgentMessage::Assistant {
            content: vec![AssistantBlock::Text { text: "step one".into() }],
            model: "m".into(),
        },
        AgentMessage::Assistant {
            content: vec![AssistantBlock::Text { text: "step two".into() }],
            model: "m".into(),
        },
        AgentMessage::ResultSuccess(ResultSuccess {
            duration_ms: 1,
            usage: Default::default(),
            last_text: "step two".into(),
        }),
    ];
    let h = Harness::start(RunnerKind::Claude, vec![script], |_| {}).await;
    h.send(assign_event("T-8", "env-11", &[])).await;

    let key = SessionKey::new("repo-A", "T-8");
    let registry = h.worker.registry();
    h.wait_for("session completed", || {
        registry.state(&key) == Some(SessionState::Completed)
    })
    .await;

    let sink = h.sink(0);
    h.wait_for("all activities", || sink.submitted().len() >= 4).await;
    let seqs: Vec<u64> = sink.submitted().iter().map(|a| a.order_seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "order_seq is monotonic in delivery order");

    let bodies: Vec<String> = sink.submitted().iter().map(|a| a.body.clone()).collect();
    let one = bodies.iter().position(|b| b == "step one").unwrap();
    let two = bodies.iter().position(|b| b == "step two").unwrap();
    assert!(one < two);
}

#[tokio::test]
async fn no_activities_after_stop() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |_| {}).await;
    h.send(assign_event("T-9", "env-12", &[])).await;

    let key = SessionKey::new("repo-A", "T-9");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;

    let mut stop = assign_event("T-9", "env-13", &[]);
    stop.kind = EventKind::Unassign;
    h.send(stop).await;
    h.wait_for("session stopped", || {
        registry.state(&key) == Some(SessionState::Stopped)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sink = h.sink(0);
    let before = sink.submitted().len();
    // Late prompts on a stopped session are rejected with an error activity,
    // but runner output never reaches the surface again.
    h.send(reply_event("T-9", "env-14", "bob", "still there?")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = sink.submitted();
    assert!(after.len() >= before);
    assert!(
        after[before..]
            .iter()
            .all(|a| a.kind == ActivityKind::Error),
        "only the rejection error may follow a stop"
    );
}

#[tokio::test]
async fn per_repository_cap_queues_excess_sessions() {
    let h = Harness::start(RunnerKind::Claude, vec![vec![init_msg("s")]], |config| {
        config
            .update(serde_json::json!({"worker": {"maxActiveSessions": 1}}))
            .unwrap();
    })
    .await;

    h.send(assign_event("T-10", "env-15", &[])).await;
    let first_key = SessionKey::new("repo-A", "T-10");
    let registry = h.worker.registry();
    h.wait_for("first active", || {
        registry.state(&first_key) == Some(SessionState::Active)
    })
    .await;

    h.send(assign_event("T-11", "env-16", &[])).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.runner_count(), 1, "second session held behind the cap");

    // Finishing the first session admits the queued one.
    h.runner(0).emit(AgentMessage::ResultSuccess(ResultSuccess::default()));
    h.wait_for("second admitted", || h.runner_count() == 2).await;
    let second_key = SessionKey::new("repo-A", "T-11");
    h.wait_for("second active", || {
        registry.state(&second_key) == Some(SessionState::Active)
    })
    .await;
}

#[tokio::test]
async fn non_streaming_runner_queues_and_replays_prompts() {
    let h = Harness::start(RunnerKind::Gemini, vec![vec![init_msg("s")]], |_| {}).await;

    h.send(assign_event("T-12", "env-17", &[])).await;
    let key = SessionKey::new("repo-A", "T-12");
    let registry = h.worker.registry();
    h.wait_for("session active", || {
        registry.state(&key) == Some(SessionState::Active)
    })
    .await;

    // Gemini cannot take streaming input: the reply must queue.
    h.send(reply_event("T-12", "env-18", "bob", "follow-up")).await;
    h.wait_for("prompt queued", || {
        registry
            .snapshots()
            .first()
            .map(|s| s.queued_prompts == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(h.runner(0).stream_inputs().is_empty());

    // When the turn completes, the queue replays as a fresh turn.
    h.runner(0).emit(AgentMessage::ResultSuccess(ResultSuccess::default()));
    h.wait_for("prompt replayed", || {
        h.runner(0).started_prompts().len() == 2
    })
    .await;
    let replayed = h.runner(0).started_prompts()[1].clone();
    assert!(replayed.contains("<new_comment><author>bob</author>"));
}
