// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The EdgeWorker orchestration core.
//!
//! # Data flow
//!
//! ```text
//! Transport ──InboundEvent──► dedup ──► Router ──intent──► EdgeWorker
//!                                                             │
//!                     ┌───────────────────────────────────────┤
//!                     ▼                                       ▼
//!             SessionRegistry (arena)                 WorkspaceManager
//!                     │                                       │
//!                     ▼                                       ▼
//!             AgentRunner (subprocess) ──messages──► Translator ──► SinkPump
//!                                                                      │
//!                                                      Surface ◄───────┘
//! ```
//!
//! # Control flow
//!
//! The ConfigManager publishes reload events; the worker stops and frees
//! sessions whose repository was removed or materially changed, preserving
//! all others. A failing hot-apply rolls the config back.
//!
//! Runners and sinks never hold references to session records — they are
//! reached through the registry by [`cyrus_protocol::SessionKey`], keeping
//! the object graph acyclic.

mod dispatcher;
mod hooks;
mod registry;
mod router;
mod translate;
mod worker;
mod workspace;

pub use dispatcher::{BurstBuffer, RepoQueues, SinkPump};
pub use hooks::{hooks_for_prompt, NoHooks, OrchestratorHooks, PromptHooks, ToolHookDecision};
pub use registry::{SessionRecord, SessionRegistry};
pub use router::{
    resolve_tools, route_event, DispatchIntent, PromptChoice, RouteError, RouteMetadata,
};
pub use translate::Translator;
pub use worker::{EdgeWorker, EdgeWorkerOptions, RunnerFactory, RunnerRequest, SinkFactory};
pub use workspace::WorkspaceManager;
