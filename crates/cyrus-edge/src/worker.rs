// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The EdgeWorker: one loop that owns every session.
//!
//! Inbound events arrive on one channel; config reloads on another. Each
//! accepted event is deduplicated, routed against the current config
//! snapshot, and dispatched:
//!
//! - *create* — admission-checked against the per-repository cap, then a
//!   workspace is prepared, a sink and runner are built through the
//!   injected factories, and a session task pumps the runner's canonical
//!   stream through the translator into the session's sink pump;
//! - *prompt* — merged through the burst buffer into a streaming runner,
//!   queued for a busy non-streaming one, or used to restart a finished
//!   session (bounded respawn budget after failures);
//! - *stop* — queued prompts are discarded with an error activity and the
//!   runner is terminated; nothing is posted for the session afterwards.
//!
//! Config reloads stop and free the sessions of removed repositories and of
//! repositories whose checkout path or token changed; every other session
//! is preserved. A reload the worker cannot apply is rolled back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cyrus_config::{Config, ConfigEvent, ConfigManager};
use cyrus_protocol::{
    Activity, ActivitySignal, AgentMessage, EventKind, InboundEvent, SessionKey, SessionState,
};
use cyrus_prompts::{load_system_prompt, render_issue_prompt, wrap_new_comment, IssueContext};
use cyrus_runner::{AgentRunner, RunnerKind};
use cyrus_tracker::{ActivitySink, IssueTracker};
use cyrus_transport::DedupWindow;

use crate::dispatcher::{BurstBuffer, RepoQueues, SinkPump};
use crate::hooks::{hooks_for_prompt, ToolHookDecision};
use crate::registry::{SessionRecord, SessionRegistry};
use crate::router::{route_event, DispatchIntent};
use crate::translate::Translator;
use crate::workspace::WorkspaceManager;

/// Spawn retries allowed per session before prompts are rejected.
const SPAWN_RETRY_BUDGET: u32 = 3;
/// Base delay for the spawn retry backoff (doubles per attempt).
const SPAWN_RETRY_BASE: Duration = Duration::from_millis(250);
/// Sink delivery attempts per activity.
const SINK_ATTEMPTS: u32 = 5;
const SINK_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Everything a factory needs to build a runner for one session.
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    pub kind: RunnerKind,
    pub key: SessionKey,
    pub workspace: PathBuf,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub log_dir: PathBuf,
    pub prompt_name: String,
    pub prompt_type: &'static str,
}

pub type RunnerFactory = Arc<dyn Fn(&RunnerRequest) -> Arc<dyn AgentRunner> + Send + Sync>;

/// Builds the activity sink for a new session (usually by opening a tracker
/// agent session, hence async and fallible).
pub type SinkFactory = Arc<
    dyn Fn(&SessionKey, &InboundEvent) -> BoxFuture<'static, anyhow::Result<Arc<dyn ActivitySink>>>
        + Send
        + Sync,
>;

pub struct EdgeWorkerOptions {
    pub config: Arc<ConfigManager>,
    pub runner_factory: RunnerFactory,
    pub sink_factory: SinkFactory,
    /// Runner kind for new sessions.
    pub runner_kind: RunnerKind,
    pub workspaces: WorkspaceManager,
    pub prompts_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Enriches issue prompts with title/description when available.
    pub tracker: Option<Arc<dyn IssueTracker>>,
}

pub struct EdgeWorker {
    config: Arc<ConfigManager>,
    applied: Mutex<Arc<Config>>,
    registry: Arc<SessionRegistry>,
    runner_factory: RunnerFactory,
    sink_factory: SinkFactory,
    runner_kind: RunnerKind,
    workspaces: WorkspaceManager,
    prompts_dir: PathBuf,
    log_dir: PathBuf,
    tracker: Option<Arc<dyn IssueTracker>>,
    dedup: DedupWindow,
    repo_queues: RepoQueues,
    bursts: BurstBuffer,
    pumps: Mutex<HashMap<SessionKey, SinkPump>>,
}

impl EdgeWorker {
    pub fn new(opts: EdgeWorkerOptions) -> Arc<Self> {
        let initial = opts.config.get();
        let dedup = DedupWindow::new(Duration::from_secs(initial.worker.dedup_window_secs));
        let bursts = BurstBuffer::new(Duration::from_millis(initial.worker.burst_window_ms));
        Arc::new(Self {
            applied: Mutex::new(initial),
            config: opts.config,
            registry: Arc::new(SessionRegistry::new()),
            runner_factory: opts.runner_factory,
            sink_factory: opts.sink_factory,
            runner_kind: opts.runner_kind,
            workspaces: opts.workspaces,
            prompts_dir: opts.prompts_dir,
            log_dir: opts.log_dir,
            tracker: opts.tracker,
            dedup,
            repo_queues: RepoQueues::new(),
            bursts,
            pumps: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Main loop: runs until the event channel closes, then drains.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<InboundEvent>) {
        info!("edge worker started");
        let mut config_rx = self.config.subscribe();
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                result = config_rx.recv() => match result {
                    Ok(event) => self.apply_config_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("config event stream lagged {n} events, forcing reload");
                        let _ = self.config.reload();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                },
            }
        }
        let grace = Duration::from_secs(self.config.get().worker.shutdown_grace_secs);
        self.drain(grace).await;
        info!("edge worker stopped");
    }

    // ── Event handling ────────────────────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        if !self.dedup.first_seen(event.transport, &event.envelope_id) {
            debug!(envelope = %event.envelope_id, "duplicate delivery dropped");
            return;
        }

        let config = self.config.get();
        let registry = self.registry.clone();
        let intent = route_event(&config, event, |repo_id, ev| {
            let issue = ev.issue.as_ref()?;
            let thread = ev.surface.thread_id.as_deref().unwrap_or("");
            let key = registry.find_for_issue(repo_id, &issue.issue_id, thread)?;
            // A fresh assignment on a finished session starts over instead
            // of prompting the dead record.
            if ev.kind == EventKind::NewThread && !registry.is_live(&key) {
                return None;
            }
            Some(key)
        });

        match intent {
            Ok(intent) => self.dispatch(intent).await,
            Err(e) => warn!("route error, event discarded: {e}"),
        }
    }

    async fn dispatch(self: &Arc<Self>, intent: DispatchIntent) {
        // Creates are admission-checked against the per-repository cap.
        let create_repo = match &intent {
            DispatchIntent::CreateSession { key, .. } => Some(key.repository_id.clone()),
            _ => None,
        };
        if let Some(repo_id) = create_repo {
            let cap = self.config.get().worker.max_active_sessions;
            if self.registry.live_count_for_repo(&repo_id) >= cap {
                self.repo_queues.push(&repo_id, intent);
            } else {
                self.create_session(intent).await;
            }
            return;
        }

        match intent {
            DispatchIntent::Ignore { reason } => debug!("event ignored: {reason}"),
            DispatchIntent::StopSession { key, .. } => {
                self.stop_session(&key, "stopped by user").await
            }
            DispatchIntent::PromptExisting { key, event } => self.prompt_existing(key, event).await,
            DispatchIntent::CreateSession { .. } => unreachable!("handled above"),
        }
    }

    fn create_session(self: &Arc<Self>, intent: DispatchIntent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
        let DispatchIntent::CreateSession {
            key,
            event,
            prompt,
            tools,
            metadata,
        } = intent
        else {
            return;
        };
        for warning in &metadata.warnings {
            warn!(key = %key, "{warning}");
        }

        let config = self.config.get();
        let Some(repo) = config.repository(&key.repository_id).cloned() else {
            warn!(key = %key, "repository vanished before session creation");
            return;
        };
        let issue = event.issue.clone().expect("create intents carry an issue");

        let workspace = match self
            .workspaces
            .prepare(&repo.repository_path, &repo.base_branch, &issue.issue_key)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!(key = %key, "workspace preparation failed: {e:#}");
                return;
            }
        };

        let sink = match (self.sink_factory)(&key, &event).await {
            Ok(sink) => sink,
            Err(e) => {
                error!(key = %key, "sink creation failed: {e:#}");
                return;
            }
        };

        let system_prompt = match load_system_prompt(&prompt.name, &prompt.rule, &self.prompts_dir)
        {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(key = %key, "system prompt unavailable, using provider default: {e:#}");
                None
            }
        };

        let request = RunnerRequest {
            kind: self.runner_kind,
            key: key.clone(),
            workspace: workspace.clone(),
            system_prompt,
            allowed_tools: tools,
            log_dir: self.log_dir.join(workspace.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_else(|| "workspace".into())),
            prompt_name: prompt.name.clone(),
            prompt_type: prompt.prompt_type,
        };
        let runner = (self.runner_factory)(&request);
        let supports_streaming = runner.supports_streaming_input();

        let previous_pump = self.pumps.lock().expect("pumps lock").insert(
            key.clone(),
            SinkPump::start(sink.clone(), SINK_ATTEMPTS, SINK_BACKOFF_BASE),
        );
        if let Some(old) = previous_pump {
            // Recreating over a finished session: flush its leftovers.
            tokio::spawn(async move { old.close().await });
        }

        self.registry.insert(SessionRecord {
            key: key.clone(),
            provider_session_id: None,
            state: SessionState::Pending,
            runner_kind: self.runner_kind.as_str().to_string(),
            workspace_path: workspace,
            runner,
            sink,
            created_at: chrono::Utc::now(),
            last_activity_at: chrono::Utc::now(),
            message_count: 0,
            pending_prompts: Default::default(),
            supports_streaming,
            spawn_attempts: 0,
        });

        let user_prompt = self.build_issue_prompt(&issue, &event).await;
        info!(key = %key, prompt = %prompt.name, kind = prompt.prompt_type, "session created");
        let worker = self.clone();
        let prompt_name = prompt.name;
        tokio::spawn(async move {
            worker.run_session_turn(key, user_prompt, prompt_name).await;
        });
        })
    }

    /// Render the first user prompt, enriching from the tracker when we can.
    async fn build_issue_prompt(
        &self,
        issue: &cyrus_protocol::IssueRefs,
        event: &InboundEvent,
    ) -> String {
        let mut ctx = IssueContext {
            issue_id: issue.issue_id.clone(),
            issue_key: issue.issue_key.clone(),
            title: issue.issue_key.clone(),
            description: String::new(),
            comment: (!event.content.is_empty()).then(|| event.content.clone()),
            author: (!event.author.is_empty()).then(|| event.author.clone()),
        };
        if let Some(tracker) = &self.tracker {
            match tracker.fetch_issue(&issue.issue_id).await {
                Ok(full) => {
                    ctx.title = full.title;
                    ctx.description = full.description;
                }
                Err(e) => debug!("issue fetch failed, rendering from event only: {e}"),
            }
        }
        render_issue_prompt(&ctx)
    }

    /// One runner turn: start (or restart) the subprocess and pump its
    /// canonical stream until the terminal message.
    fn run_session_turn(
        self: Arc<Self>,
        key: SessionKey,
        prompt: String,
        prompt_name: String,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
        let Some(runner) = self.registry.runner(&key) else {
            return;
        };
        // Subscribe before start so no message is missed.
        let mut rx = runner.subscribe();

        let started = if runner.supports_streaming_input() {
            runner.start_streaming(Some(&prompt)).await
        } else {
            runner.start(&prompt).await
        };
        if let Err(e) = started {
            error!(key = %key, "runner spawn failed: {e}");
            self.registry.with_session(&key, |s| {
                s.spawn_attempts += 1;
                s.state = SessionState::Failed;
            });
            self.enqueue_activity(
                &key,
                Activity::error(format!("Could not start the agent: {e}"))
                    .with_signal(ActivitySignal::Stop),
            );
            self.after_turn(&key).await;
            return;
        }
        self.registry
            .with_session(&key, |s| s.spawn_attempts = 0);

        let mut translator = Translator::new(runner.formatter());
        let hooks = hooks_for_prompt(&prompt_name);
        // tool_use id → (name, input), for the post-tool hook.
        let mut open_tools: HashMap<String, (String, serde_json::Value)> = HashMap::new();

        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(key = %key, "runner stream lagged {n} messages");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            self.registry.with_session(&key, |s| {
                s.message_count += 1;
                s.last_activity_at = chrono::Utc::now();
            });

            match &msg {
                AgentMessage::SystemInit(init) => {
                    self.registry.with_session(&key, |s| {
                        s.provider_session_id = Some(init.session_id.clone());
                        if s.state == SessionState::Pending {
                            s.state = SessionState::Active;
                        }
                    });
                }
                AgentMessage::Assistant { .. } => {
                    for tool in msg.tool_uses() {
                        open_tools
                            .insert(tool.id.clone(), (tool.name.clone(), tool.input.clone()));
                        if let ToolHookDecision::Inject(guidance) =
                            hooks.pre_tool_use(&tool.name, &tool.input)
                        {
                            let _ = runner.add_stream_message(&guidance).await;
                        }
                    }
                }
                AgentMessage::ToolResult {
                    tool_use_id,
                    is_error,
                    ..
                } => {
                    if let Some((name, input)) = open_tools.remove(tool_use_id) {
                        if let ToolHookDecision::Inject(guidance) =
                            hooks.post_tool_use(&name, &input, *is_error)
                        {
                            let _ = runner.add_stream_message(&guidance).await;
                        }
                    }
                }
                _ => {}
            }

            let stopped = self.registry.state(&key) == Some(SessionState::Stopped);
            for activity in translator.translate(&msg) {
                if stopped {
                    // Stop is final for the surface; late runner output is
                    // logged but never posted.
                    debug!(key = %key, "suppressing activity after stop");
                    continue;
                }
                self.enqueue_activity(&key, activity);
            }

            if msg.is_terminal() {
                self.registry.with_session(&key, |s| {
                    if s.state != SessionState::Stopped {
                        s.state = match msg {
                            AgentMessage::ResultSuccess(_) => SessionState::Completed,
                            _ => SessionState::Failed,
                        };
                    }
                });
                break;
            }
        }

        self.after_turn(&key).await;
        })
    }

    /// Post-turn bookkeeping: replay queued prompts, admit deferred
    /// sessions for the repository.
    fn after_turn<'a>(self: &'a Arc<Self>, key: &'a SessionKey) -> BoxFuture<'a, ()> {
        Box::pin(async move {
        let state = self.registry.state(key);
        let queued: Vec<String> = self
            .registry
            .with_session(key, |s| s.pending_prompts.drain(..).collect())
            .unwrap_or_default();

        if !queued.is_empty() && state == Some(SessionState::Completed) {
            let merged = queued.join("\n");
            debug!(key = %key, "replaying {} queued prompt(s)", merged.lines().count());
            let worker = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                worker.restart_session(key, merged).await;
            });
            return;
        }

        // A slot freed up: admit the next deferred create for this repo.
        if let Some(next) = self.repo_queues.pop(&key.repository_id) {
            let worker = self.clone();
            tokio::spawn(async move {
                worker.create_session(next).await;
            });
        }
        })
    }

    fn restart_session(
        self: Arc<Self>,
        key: SessionKey,
        prompt: String,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
        self.registry.set_state(&key, SessionState::Pending);
        let prompt_name = "follow-up".to_string();
        self.run_session_turn(key, prompt, prompt_name).await;
        })
    }

    async fn prompt_existing(self: &Arc<Self>, key: SessionKey, event: InboundEvent) {
        let Some(state) = self.registry.state(&key) else {
            warn!(key = %key, "prompt for unknown session dropped");
            return;
        };
        let wrapped = wrap_new_comment(&event.author, event.occurred_at, &event.content);

        match state {
            SessionState::Active | SessionState::Pending | SessionState::AwaitingInput => {
                if state == SessionState::AwaitingInput {
                    self.registry.set_state(&key, SessionState::Active);
                }
                let supports_streaming = self
                    .registry
                    .with_session(&key, |s| s.supports_streaming)
                    .unwrap_or(false);
                if supports_streaming {
                    // The burst owner sleeps out the merge window; do that
                    // off the main loop.
                    let worker = self.clone();
                    tokio::spawn(async move {
                        if let Some(merged) = worker.bursts.push(&key, wrapped).await {
                            worker.deliver_stream_message(&key, merged).await;
                        }
                    });
                } else {
                    self.registry
                        .with_session(&key, |s| s.pending_prompts.push_back(wrapped));
                }
            }
            SessionState::Completed => {
                // Finished sessions accept follow-ups by restarting the
                // runner in the same workspace.
                let worker = self.clone();
                tokio::spawn(async move {
                    worker.restart_session(key, wrapped).await;
                });
            }
            SessionState::Failed => {
                let attempts = self
                    .registry
                    .with_session(&key, |s| s.spawn_attempts)
                    .unwrap_or(0);
                if attempts >= SPAWN_RETRY_BUDGET {
                    self.enqueue_activity(
                        &key,
                        Activity::error(
                            "The agent could not be restarted; giving up on this session."
                                .to_string(),
                        ),
                    );
                    return;
                }
                let backoff = SPAWN_RETRY_BASE * 2u32.saturating_pow(attempts);
                info!(key = %key, attempts, "respawning failed session in {backoff:?}");
                let worker = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    worker.restart_session(key, wrapped).await;
                });
            }
            SessionState::Stopped => {
                self.enqueue_activity(
                    &key,
                    Activity::error("This session was stopped; the prompt was not delivered.".to_string()),
                );
            }
        }
    }

    async fn deliver_stream_message(&self, key: &SessionKey, merged: String) {
        let Some(runner) = self.registry.runner(key) else {
            return;
        };
        if let Err(e) = runner.add_stream_message(&merged).await {
            warn!(key = %key, "stream delivery failed, queueing for replay: {e}");
            self.registry
                .with_session(key, |s| s.pending_prompts.push_back(merged));
        }
    }

    async fn stop_session(&self, key: &SessionKey, reason: &str) {
        let Some(state) = self.registry.state(key) else {
            return;
        };
        if state.is_terminal() {
            debug!(key = %key, "stop on terminal session ignored");
            return;
        }

        let discarded_bursts = self.bursts.discard(key);
        let discarded: usize = self
            .registry
            .with_session(key, |s| {
                let n = s.pending_prompts.len();
                s.pending_prompts.clear();
                n
            })
            .unwrap_or(0)
            + discarded_bursts;
        if discarded > 0 {
            self.enqueue_activity(
                key,
                Activity::error(format!(
                    "{discarded} queued prompt(s) were discarded because the session was stopped."
                )),
            );
        }

        // Stopped must be visible before the runner's synthesised terminal
        // message so late output is suppressed.
        self.registry.set_state(key, SessionState::Stopped);
        if let Some(runner) = self.registry.runner(key) {
            runner.stop().await;
        }
        info!(key = %key, reason, "session stopped");
    }

    fn enqueue_activity(&self, key: &SessionKey, activity: Activity) {
        if let Some(pump) = self.pumps.lock().expect("pumps lock").get(key) {
            pump.enqueue(activity);
        }
    }

    // ── Config hot-apply ──────────────────────────────────────────────────────

    async fn apply_config_event(self: &Arc<Self>, event: ConfigEvent) {
        match event {
            ConfigEvent::Reloaded { config, diff } => {
                let previous = {
                    let mut applied = self.applied.lock().expect("applied lock");
                    std::mem::replace(&mut *applied, config.clone())
                };
                if let Err(e) = self.apply_reload(&previous, &config, &diff).await {
                    error!("config hot-apply failed, rolling back: {e:#}");
                    *self.applied.lock().expect("applied lock") = previous;
                    if let Err(rollback_err) = self.config.rollback(format!("{e:#}")) {
                        error!("rollback also failed: {rollback_err:#}");
                    }
                }
            }
            ConfigEvent::Error { message } => warn!("config error: {message}"),
            ConfigEvent::RolledBack { reason } => warn!("config rolled back: {reason}"),
        }
    }

    async fn apply_reload(
        self: &Arc<Self>,
        previous: &Config,
        current: &Config,
        diff: &cyrus_config::ConfigDiff,
    ) -> anyhow::Result<()> {
        // Removed repositories lose everything.
        let mut affected: Vec<String> = diff.removed.clone();

        // Modified repositories only drain when the change invalidates the
        // sessions: a different checkout path or token.
        for repo_id in &diff.modified {
            let old = previous.repository(repo_id);
            let new = current.repository(repo_id);
            let material = match (old, new) {
                (Some(old), Some(new)) => {
                    old.repository_path != new.repository_path
                        || old.linear_token != new.linear_token
                }
                _ => true,
            };
            if material {
                affected.push(repo_id.clone());
            }
        }

        for repo_id in &affected {
            let dropped = self.repo_queues.clear(repo_id);
            if dropped > 0 {
                info!(repo = %repo_id, dropped, "queued intents discarded on reload");
            }
            for key in self.registry.keys_for_repo(repo_id) {
                info!(key = %key, "terminating session: repository_removed");
                self.enqueue_activity(
                    &key,
                    Activity::error("Session terminated: repository_removed".to_string())
                        .with_signal(ActivitySignal::Stop),
                );
                self.stop_session(&key, "repository_removed").await;
                self.free_session(&key).await;
            }
        }
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "config reload applied"
        );
        Ok(())
    }

    /// Remove a session record and flush-close its pump and workspace.
    async fn free_session(&self, key: &SessionKey) {
        let record = self.registry.remove(key);
        let pump = self.pumps.lock().expect("pumps lock").remove(key);
        if let Some(pump) = pump {
            pump.close().await;
        }
        if let Some(record) = record {
            let config = self.config.get();
            if let Some(repo) = config.repository(&key.repository_id) {
                self.workspaces
                    .release(&repo.repository_path, &record.workspace_path)
                    .await;
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Graceful drain: stop every runner, then flush every pump, bounded by
    /// `grace`.
    pub async fn drain(self: &Arc<Self>, grace: Duration) {
        info!("draining sessions for shutdown");
        let keys: Vec<SessionKey> = self
            .registry
            .snapshots()
            .into_iter()
            .map(|s| s.key)
            .collect();
        let drain_all = async {
            for key in &keys {
                self.stop_session(key, "worker shutdown").await;
            }
            let pumps: Vec<SinkPump> = {
                let mut map = self.pumps.lock().expect("pumps lock");
                keys.iter().filter_map(|k| map.remove(k)).collect()
            };
            for pump in pumps {
                pump.close().await;
            }
        };
        if tokio::time::timeout(grace, drain_all).await.is_err() {
            warn!("shutdown grace expired with sessions still draining");
        }
    }
}
