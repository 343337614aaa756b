// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subprocess supervision and stream normalisation.
//!
//! [`ProcessRunner`] owns one provider subprocess as a direct child. A
//! reader task pumps stdout lines through the dialect's [`StreamAdapter`]
//! and a [`Normalizer`] that enforces the canonical stream shape:
//!
//! - a `system.init` is synthesised when the provider never sends one (or
//!   sends only a bare session id);
//! - consecutive same-role text deltas accumulate into one message;
//! - every tool call gets a session-unique id and a result — synthetic
//!   error results close calls left open by a dying process;
//! - a `result.*` is synthesised from (stderr, exit code, last assistant
//!   text) when the process exits without one.
//!
//! `is_running()` turns false *before* the terminal message is broadcast,
//! so a caller that observes `true` can still safely write to stdin.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cyrus_protocol::{
    AgentMessage, AssistantBlock, ResultError, ResultSuccess, SystemInit, ToolUse, Usage,
};

use crate::adapter::{ProviderEvent, StreamAdapter, TextRole};
use crate::accumulator::DeltaAccumulator;
use crate::format::MessageFormatter;
use crate::log::SessionLog;
use crate::pairing::ToolPairing;
use crate::runner::{AgentRunner, RunnerConfig, RunnerError, RunnerKind};

/// How many trailing stderr bytes feed into a synthesised error result.
const STDERR_TAIL: usize = 4096;

pub struct ProcessRunner {
    config: RunnerConfig,
    formatter: Arc<dyn MessageFormatter>,
    event_tx: broadcast::Sender<AgentMessage>,
    messages: Arc<StdMutex<Vec<AgentMessage>>>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    /// Cancelling this makes the reader task kill the child.
    kill_token: StdMutex<CancellationToken>,
    /// Notified after the terminal message has been emitted.
    exited: Arc<Notify>,
    /// Stdin of the live child while streaming input is open.
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    child_pid: StdMutex<Option<u32>>,
    /// Supervisor-generated id; names the log files. The provider session id
    /// arrives later (if at all) via `system.init`.
    session_id: String,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let (_, formatter) = crate::adapter_for(config.kind);
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            config,
            formatter,
            event_tx,
            messages: Arc::new(StdMutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            kill_token: StdMutex::new(CancellationToken::new()),
            exited: Arc::new(Notify::new()),
            stdin: Mutex::new(None),
            child_pid: StdMutex::new(None),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn spawn(&self, streaming: bool, initial: Option<&str>) -> Result<(), RunnerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        let kill_token = CancellationToken::new();
        *self.kill_token.lock().expect("kill token lock") = kill_token.clone();

        let (mut adapter, _) = crate::adapter_for(self.config.kind);

        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .args(adapter.protocol_args(streaming))
            .current_dir(&self.config.cwd)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| {
            self.running.store(false, Ordering::SeqCst);
            RunnerError::Spawn {
                command: self.config.command.clone(),
                source,
            }
        })?;

        let pid = child.id();
        *self.child_pid.lock().expect("pid lock") = pid;
        info!(
            kind = self.config.kind.as_str(),
            pid,
            cwd = %self.config.cwd.display(),
            "runner spawned"
        );

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdin = child.stdin.take();

        // Deliver the initial prompt. Non-streaming runs close stdin after
        // it so the provider knows the turn is complete.
        if let Some(text) = initial {
            if let Some(handle) = stdin.as_mut() {
                if let Err(e) = handle.write_all(adapter.encode_prompt(text).as_bytes()).await {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(RunnerError::StdinWrite(e));
                }
            }
        }
        if streaming {
            *self.stdin.lock().await = stdin;
        } else {
            drop(stdin);
        }

        let mut log = SessionLog::create(&self.config.log_dir, &self.session_id)
            .map_err(|e| {
                warn!("session log unavailable: {e:#}");
                e
            })
            .ok();
        if let Some(log) = log.as_mut() {
            log.note(&format!(
                "spawned {} (pid {:?}) in {}",
                self.config.command,
                pid,
                self.config.cwd.display()
            ));
        }

        // Collect stderr concurrently; its tail feeds synthesised errors.
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if collected.len() < STDERR_TAIL {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let mut normalizer = Normalizer::new(
            self.session_id.clone(),
            self.config.cwd.display().to_string(),
            self.config.model.clone(),
            self.config.allowed_tools.clone(),
        );

        let event_tx = self.event_tx.clone();
        let messages = self.messages.clone();
        let running = self.running.clone();
        let stop_requested = self.stop_requested.clone();
        let exited = self.exited.clone();
        let idle_timeout = self.config.idle_timeout_secs.map(Duration::from_secs);
        let kind = self.config.kind;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut idle_stopped = false;

            loop {
                let next = async { lines.next_line().await };
                let line = tokio::select! {
                    line = next => line,
                    _ = kill_token.cancelled() => {
                        let _ = child.start_kill();
                        break;
                    }
                    _ = sleep_opt(idle_timeout) => {
                        warn!(kind = kind.as_str(), "runner idle timeout, stopping");
                        idle_stopped = true;
                        let _ = child.start_kill();
                        break;
                    }
                };
                match line {
                    Ok(Some(line)) => {
                        if let Some(log) = log.as_mut() {
                            log.raw_line(&line);
                        }
                        for event in adapter.parse_line(&line) {
                            for msg in normalizer.feed(event) {
                                emit(&msg, &messages, &event_tx, log.as_mut(), &running, &exited);
                            }
                        }
                        if normalizer.terminal_emitted {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("runner stdout read error: {e}");
                        break;
                    }
                }
            }

            let status = child.wait().await.ok();
            let stderr_tail = stderr_task.await.unwrap_or_default();
            let exit_code = status.and_then(|s| s.code());
            if let Some(log) = log.as_mut() {
                log.note(&format!("process exited with {exit_code:?}"));
            }

            let clean = !idle_stopped
                && (exit_code == Some(0) || stop_requested.load(Ordering::SeqCst));
            let reason = if idle_stopped {
                Some("idle timeout".to_string())
            } else {
                None
            };
            for msg in normalizer.finalize(clean, exit_code, &stderr_tail, reason) {
                emit(&msg, &messages, &event_tx, log.as_mut(), &running, &exited);
            }
            // Belt-and-braces for streams that ended exactly at the terminal.
            if running.swap(false, Ordering::SeqCst) {
                exited.notify_waiters();
            }
        });

        Ok(())
    }
}

/// Append, log, and broadcast one canonical message. The running flag drops
/// before a terminal message goes out.
fn emit(
    msg: &AgentMessage,
    messages: &StdMutex<Vec<AgentMessage>>,
    event_tx: &broadcast::Sender<AgentMessage>,
    log: Option<&mut SessionLog>,
    running: &AtomicBool,
    exited: &Notify,
) {
    messages.lock().expect("messages lock").push(msg.clone());
    if let Some(log) = log {
        log.message(msg);
    }
    if msg.is_terminal() {
        running.store(false, Ordering::SeqCst);
    }
    let _ = event_tx.send(msg.clone());
    if msg.is_terminal() {
        exited.notify_waiters();
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl AgentRunner for ProcessRunner {
    fn kind(&self) -> RunnerKind {
        self.config.kind
    }

    async fn start(&self, prompt: &str) -> Result<(), RunnerError> {
        self.spawn(false, Some(prompt)).await
    }

    async fn start_streaming(&self, initial: Option<&str>) -> Result<(), RunnerError> {
        if !self.config.kind.supports_streaming_input() {
            return Err(RunnerError::StreamingUnsupported);
        }
        self.spawn(true, initial).await
    }

    async fn add_stream_message(&self, text: &str) -> Result<(), RunnerError> {
        if !self.is_running() {
            return Err(RunnerError::NotRunning);
        }
        let (adapter, _) = crate::adapter_for(self.config.kind);
        let encoded = adapter.encode_prompt(text);
        drop(adapter);
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(handle) => handle
                .write_all(encoded.as_bytes())
                .await
                .map_err(RunnerError::StdinWrite),
            None => Err(RunnerError::StreamingUnsupported),
        }
    }

    async fn complete_stream(&self) -> Result<(), RunnerError> {
        // Dropping stdin signals EOF; the provider finishes its final turn.
        let _ = self.stdin.lock().await.take();
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.stdin.lock().await.take();

        let pid = *self.child_pid.lock().expect("pid lock");
        #[cfg(unix)]
        if let Some(pid) = pid {
            // Polite first: SIGTERM, then escalate after the grace period.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        let grace = Duration::from_secs(self.config.stop_grace_secs);
        let exited = self.exited.clone();
        if tokio::time::timeout(grace, exited.notified()).await.is_err()
            && self.running.load(Ordering::SeqCst)
        {
            warn!("runner did not exit within grace period, killing");
            self.kill_token.lock().expect("kill token lock").cancel();
            let _ = tokio::time::timeout(Duration::from_secs(2), self.exited.notified()).await;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn messages(&self) -> Vec<AgentMessage> {
        self.messages.lock().expect("messages lock").clone()
    }

    fn formatter(&self) -> Arc<dyn MessageFormatter> {
        self.formatter.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentMessage> {
        self.event_tx.subscribe()
    }
}

// ── Normalisation ─────────────────────────────────────────────────────────────

/// Dialect-independent enforcement of the canonical stream invariants.
struct Normalizer {
    fallback_session_id: String,
    cwd: String,
    model: String,
    tools: Vec<String>,
    init_emitted: bool,
    terminal_emitted: bool,
    accumulator: DeltaAccumulator,
    pairing: ToolPairing,
    usage: Usage,
    last_text: Option<String>,
    started: Instant,
}

impl Normalizer {
    fn new(fallback_session_id: String, cwd: String, model: String, tools: Vec<String>) -> Self {
        Self {
            fallback_session_id,
            cwd,
            model,
            tools,
            init_emitted: false,
            terminal_emitted: false,
            accumulator: DeltaAccumulator::new(),
            pairing: ToolPairing::new(),
            usage: Usage::default(),
            last_text: None,
            started: Instant::now(),
        }
    }

    fn feed(&mut self, event: ProviderEvent) -> Vec<AgentMessage> {
        if self.terminal_emitted {
            // Terminal means terminal; anything after is log-only.
            debug!("provider event after terminal result ignored: {event:?}");
            return Vec::new();
        }
        let mut out = Vec::new();
        match event {
            ProviderEvent::Init(init) => {
                if !self.init_emitted {
                    self.init_emitted = true;
                    out.push(AgentMessage::SystemInit(init));
                }
            }
            ProviderEvent::SessionId(id) => {
                if !self.init_emitted {
                    out.push(self.synthesize_init(Some(id)));
                }
            }
            ProviderEvent::Text { role, text, delta } => {
                self.ensure_init(&mut out);
                if delta {
                    if let Some(flushed) = self.accumulator.push(role, &text) {
                        out.push(self.text_message(flushed.0, flushed.1));
                    }
                } else {
                    if let Some(flushed) = self.accumulator.flush() {
                        out.push(self.text_message(flushed.0, flushed.1));
                    }
                    if !text.is_empty() {
                        out.push(self.text_message(role, text));
                    }
                }
            }
            ProviderEvent::ToolCall { id, name, input } => {
                self.ensure_init(&mut out);
                if let Some(flushed) = self.accumulator.flush() {
                    out.push(self.text_message(flushed.0, flushed.1));
                }
                let id = self.pairing.register_call(id, &name);
                out.push(AgentMessage::Assistant {
                    content: vec![AssistantBlock::ToolUse(ToolUse { id, name, input })],
                    model: self.model.clone(),
                });
            }
            ProviderEvent::ToolResult {
                id,
                name,
                content,
                is_error,
            } => {
                self.ensure_init(&mut out);
                if let Some(flushed) = self.accumulator.flush() {
                    out.push(self.text_message(flushed.0, flushed.1));
                }
                match self.pairing.resolve_result(id.as_deref(), name.as_deref()) {
                    Some(tool_use_id) => out.push(AgentMessage::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    }),
                    None => warn!("orphan tool result dropped (id={id:?}, name={name:?})"),
                }
            }
            ProviderEvent::Usage(usage) => {
                self.usage = usage;
            }
            ProviderEvent::Completed { last_text } => {
                self.ensure_init(&mut out);
                self.close_stream(&mut out);
                let last_text = last_text.or_else(|| self.last_text.clone()).unwrap_or_default();
                self.terminal_emitted = true;
                out.push(AgentMessage::ResultSuccess(ResultSuccess {
                    duration_ms: self.started.elapsed().as_millis() as u64,
                    usage: self.usage,
                    last_text,
                }));
            }
            ProviderEvent::Errored { message } => {
                self.ensure_init(&mut out);
                self.close_stream(&mut out);
                self.terminal_emitted = true;
                out.push(AgentMessage::ResultError(ResultError {
                    duration_ms: self.started.elapsed().as_millis() as u64,
                    errors: vec![message],
                    usage: self.usage,
                }));
            }
            ProviderEvent::Ignored => {}
        }
        out
    }

    /// Synthesise the terminal messages for a process that exited without a
    /// provider result.
    fn finalize(
        &mut self,
        clean: bool,
        exit_code: Option<i32>,
        stderr_tail: &str,
        reason: Option<String>,
    ) -> Vec<AgentMessage> {
        if self.terminal_emitted {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_init(&mut out);
        self.close_stream(&mut out);
        self.terminal_emitted = true;
        let duration_ms = self.started.elapsed().as_millis() as u64;
        if clean && reason.is_none() {
            out.push(AgentMessage::ResultSuccess(ResultSuccess {
                duration_ms,
                usage: self.usage,
                last_text: self.last_text.clone().unwrap_or_default(),
            }));
        } else {
            let mut errors = Vec::new();
            if let Some(reason) = reason {
                errors.push(reason);
            }
            match exit_code {
                Some(code) => errors.push(format!("process exited with code {code}")),
                None => errors.push("process terminated by signal".to_string()),
            }
            let stderr_tail = stderr_tail.trim();
            if !stderr_tail.is_empty() {
                errors.push(format!("stderr: {stderr_tail}"));
            }
            out.push(AgentMessage::ResultError(ResultError {
                duration_ms,
                errors,
                usage: self.usage,
            }));
        }
        out
    }

    /// Flush the accumulator and close outstanding tool calls with error
    /// results — `tool_result` must precede `result.*` for every call.
    fn close_stream(&mut self, out: &mut Vec<AgentMessage>) {
        if let Some(flushed) = self.accumulator.flush() {
            out.push(self.text_message(flushed.0, flushed.1));
        }
        for (tool_use_id, name) in self.pairing.drain_outstanding() {
            out.push(AgentMessage::ToolResult {
                tool_use_id,
                content: format!("{name} did not complete before the session ended"),
                is_error: true,
            });
        }
    }

    fn ensure_init(&mut self, out: &mut Vec<AgentMessage>) {
        if !self.init_emitted {
            out.push(self.synthesize_init(None));
        }
    }

    fn synthesize_init(&mut self, session_id: Option<String>) -> AgentMessage {
        self.init_emitted = true;
        AgentMessage::SystemInit(SystemInit {
            session_id: session_id.unwrap_or_else(|| self.fallback_session_id.clone()),
            cwd: self.cwd.clone(),
            tools: self.tools.clone(),
            model: self.model.clone(),
            permission_mode: "default".to_string(),
            mcp_servers: Vec::new(),
        })
    }

    fn text_message(&mut self, role: TextRole, text: String) -> AgentMessage {
        match role {
            TextRole::Assistant => {
                self.last_text = Some(text.clone());
                AgentMessage::Assistant {
                    content: vec![AssistantBlock::Text { text }],
                    model: self.model.clone(),
                }
            }
            TextRole::User => AgentMessage::User {
                content: cyrus_protocol::UserContent::Text(text),
                parent_tool_use_id: None,
            },
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
