// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The runner contract every provider variant implements.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use cyrus_protocol::AgentMessage;

use crate::format::MessageFormatter;

/// Supported coding-agent providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Claude,
    Codex,
    Gemini,
}

impl RunnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Claude => "claude",
            RunnerKind::Codex => "codex",
            RunnerKind::Gemini => "gemini",
        }
    }

    /// Whether the provider's CLI accepts additional prompts on stdin while
    /// a turn is in flight.
    pub fn supports_streaming_input(self) -> bool {
        match self {
            RunnerKind::Claude | RunnerKind::Codex => true,
            RunnerKind::Gemini => false,
        }
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = RunnerError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(RunnerKind::Claude),
            "codex" => Ok(RunnerKind::Codex),
            "gemini" => Ok(RunnerKind::Gemini),
            other => Err(RunnerError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("unknown runner kind {0:?}")]
    UnknownKind(String),
    #[error("could not spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runner is not running")]
    NotRunning,
    #[error("runner is already running")]
    AlreadyRunning,
    #[error("runner does not support streaming input")]
    StreamingUnsupported,
    #[error("stdin write failed: {0}")]
    StdinWrite(#[source] std::io::Error),
}

/// Everything needed to launch one runner subprocess.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub kind: RunnerKind,
    /// Executable, e.g. `claude` or an absolute path.
    pub command: String,
    /// Arguments before the supervisor appends protocol flags.
    pub args: Vec<String>,
    /// Workspace directory the agent operates in.
    pub cwd: PathBuf,
    pub model: String,
    /// Tool names passed through to the provider and reported in the
    /// synthesised `system.init`.
    pub allowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub env: HashMap<String, String>,
    /// Directory for the per-session `.ndjson` / `.log` pair.
    pub log_dir: PathBuf,
    /// Seconds of stream silence before the supervisor stops the runner.
    /// `None` disables the idle timeout.
    pub idle_timeout_secs: Option<u64>,
    /// Seconds to wait after the termination signal before killing.
    pub stop_grace_secs: u64,
}

impl RunnerConfig {
    pub fn new(kind: RunnerKind, command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            model: String::new(),
            allowed_tools: Vec::new(),
            system_prompt: None,
            env: HashMap::new(),
            log_dir: std::env::temp_dir(),
            idle_timeout_secs: None,
            stop_grace_secs: 5,
        }
    }
}

/// A supervised coding-agent subprocess.
///
/// Implementations guarantee the canonical stream shape: one `system.init`
/// first, one `result.*` last, paired tool uses in between. `is_running`
/// turns false *before* the terminal message is emitted so callers that
/// check it never race a prompt into a dead process.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Launch with a single prompt; stdin closes after delivery.
    async fn start(&self, prompt: &str) -> Result<(), RunnerError>;

    /// Launch in streaming mode; stdin stays open for
    /// [`AgentRunner::add_stream_message`].
    async fn start_streaming(&self, initial: Option<&str>) -> Result<(), RunnerError>;

    /// Inject a follow-up prompt into a live streaming session.
    async fn add_stream_message(&self, text: &str) -> Result<(), RunnerError>;

    /// Close the streaming channel; the provider finishes its final turn.
    async fn complete_stream(&self) -> Result<(), RunnerError>;

    /// Terminate: signal, wait for the grace period, then kill.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Copy of every canonical message emitted so far.
    fn messages(&self) -> Vec<AgentMessage>;

    fn formatter(&self) -> Arc<dyn MessageFormatter>;

    /// Live canonical message stream.
    fn subscribe(&self) -> broadcast::Receiver<AgentMessage>;

    fn supports_streaming_input(&self) -> bool {
        self.kind().supports_streaming_input()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
