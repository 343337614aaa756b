// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Supervised coding-agent subprocesses.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────── ProcessRunner ──┐
//!  start() ──────►│ spawn child                              │
//!  add_stream…() ─│──► stdin pump                            │
//!  stop() ───────►│ SIGTERM → grace → kill                   │
//!                 │                                          │
//!                 │  stdout lines ─► StreamAdapter           │
//!                 │       │            (provider dialect)    │
//!                 │       ▼                                  │
//!                 │  Normalizer: init synthesis,             │
//!                 │  delta accumulation, tool pairing,       │
//!                 │  result finalisation                     │
//!                 └───────│──────────────────────────────────┘
//!                         ▼
//!            broadcast<AgentMessage> + session logs (.ndjson / .log)
//! ```
//!
//! Each provider dialect (claude stream-json, codex delta protocol, gemini's
//! plain line protocol) is a [`StreamAdapter`]. The supervisor is dialect
//! agnostic: it pumps stdin, feeds stdout lines through the adapter, and
//! enforces the canonical-stream invariants documented in `cyrus-protocol`.

mod accumulator;
mod adapter;
mod claude;
mod codex;
mod format;
mod gemini;
mod log;
mod mock;
mod pairing;
mod runner;
mod supervisor;

pub use accumulator::DeltaAccumulator;
pub use adapter::{ProviderEvent, StreamAdapter, TextRole};
pub use claude::{ClaudeAdapter, ClaudeFormatter};
pub use codex::{CodexAdapter, CodexFormatter};
pub use format::{plain_formatter, MessageFormatter};
pub use gemini::{GeminiAdapter, GeminiFormatter};
pub use log::SessionLog;
pub use mock::ScriptedRunner;
pub use pairing::ToolPairing;
pub use runner::{AgentRunner, RunnerConfig, RunnerError, RunnerKind};
pub use supervisor::ProcessRunner;

use std::sync::Arc;

/// Construct the adapter + formatter pair for a runner kind.
pub fn adapter_for(kind: RunnerKind) -> (Box<dyn StreamAdapter>, Arc<dyn MessageFormatter>) {
    match kind {
        RunnerKind::Claude => (Box::new(ClaudeAdapter::new()), Arc::new(ClaudeFormatter)),
        RunnerKind::Codex => (Box::new(CodexAdapter::new()), Arc::new(CodexFormatter)),
        RunnerKind::Gemini => (Box::new(GeminiAdapter::new()), Arc::new(GeminiFormatter)),
    }
}
