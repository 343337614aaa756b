// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! A scripted in-process runner for tests.
//!
//! Emits a pre-baked canonical message sequence instead of spawning a
//! subprocess, and records every prompt it receives. The orchestration
//! crates use it to exercise session plumbing without any provider CLI
//! installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;

use cyrus_protocol::{AgentMessage, ResultSuccess};

use crate::format::{plain_formatter, MessageFormatter};
use crate::runner::{AgentRunner, RunnerError, RunnerKind};

pub struct ScriptedRunner {
    kind: RunnerKind,
    script: StdMutex<Vec<AgentMessage>>,
    event_tx: broadcast::Sender<AgentMessage>,
    messages: Arc<StdMutex<Vec<AgentMessage>>>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    started_prompts: StdMutex<Vec<String>>,
    stream_inputs: StdMutex<Vec<String>>,
    streaming_override: Option<bool>,
    /// When set, spawn() fails this many times before succeeding.
    fail_spawns: StdMutex<u32>,
}

impl ScriptedRunner {
    pub fn new(kind: RunnerKind) -> Self {
        Self::with_script(kind, Vec::new())
    }

    /// A runner that plays `script` when started. If the script ends with a
    /// terminal message the runner transitions to not-running by itself.
    pub fn with_script(kind: RunnerKind, script: Vec<AgentMessage>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            kind,
            script: StdMutex::new(script),
            event_tx,
            messages: Arc::new(StdMutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            started_prompts: StdMutex::new(Vec::new()),
            stream_inputs: StdMutex::new(Vec::new()),
            streaming_override: None,
            fail_spawns: StdMutex::new(0),
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming_override = Some(streaming);
        self
    }

    /// Make the next `n` start attempts fail with a spawn error.
    pub fn fail_next_spawns(&self, n: u32) {
        *self.fail_spawns.lock().expect("lock") = n;
    }

    /// Push one message into the stream, as the subprocess reader would.
    pub fn emit(&self, msg: AgentMessage) {
        self.messages.lock().expect("lock").push(msg.clone());
        if msg.is_terminal() {
            self.running.store(false, Ordering::SeqCst);
        }
        let _ = self.event_tx.send(msg);
    }

    pub fn started_prompts(&self) -> Vec<String> {
        self.started_prompts.lock().expect("lock").clone()
    }

    pub fn stream_inputs(&self) -> Vec<String> {
        self.stream_inputs.lock().expect("lock").clone()
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn begin(&self, prompt: Option<&str>) -> Result<(), RunnerError> {
        {
            let mut fails = self.fail_spawns.lock().expect("lock");
            if *fails > 0 {
                *fails -= 1;
                return Err(RunnerError::Spawn {
                    command: "scripted".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
                });
            }
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }
        if let Some(p) = prompt {
            self.started_prompts.lock().expect("lock").push(p.to_string());
        }
        let script: Vec<AgentMessage> =
            std::mem::take(&mut *self.script.lock().expect("lock"));
        for msg in script {
            self.emit(msg);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentRunner for ScriptedRunner {
    fn kind(&self) -> RunnerKind {
        self.kind
    }

    async fn start(&self, prompt: &str) -> Result<(), RunnerError> {
        self.begin(Some(prompt))
    }

    async fn start_streaming(&self, initial: Option<&str>) -> Result<(), RunnerError> {
        if !self.supports_streaming_input() {
            return Err(RunnerError::StreamingUnsupported);
        }
        self.begin(initial)
    }

    async fn add_stream_message(&self, text: &str) -> Result<(), RunnerError> {
        if !self.is_running() {
            return Err(RunnerError::NotRunning);
        }
        self.stream_inputs.lock().expect("lock").push(text.to_string());
        Ok(())
    }

    async fn complete_stream(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn stop(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            self.emit(AgentMessage::ResultSuccess(ResultSuccess {
                duration_ms: 0,
                usage: Default::default(),
                last_text: String::new(),
            }));
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn messages(&self) -> Vec<AgentMessage> {
        self.messages.lock().expect("lock").clone()
    }

    fn formatter(&self) -> Arc<dyn MessageFormatter> {
        plain_formatter()
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentMessage> {
        self.event_tx.subscribe()
    }

    fn supports_streaming_input(&self) -> bool {
        self.streaming_override
            .unwrap_or_else(|| self.kind.supports_streaming_input())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
