// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Canonical vocabulary shared by every cyrus crate.
//!
//! Three families of types cross crate boundaries:
//!
//! - [`InboundEvent`] — what an event transport produces after verifying and
//!   normalising a surface-specific webhook payload.
//! - [`AgentMessage`] — the canonical message stream every agent runner
//!   adapter emits, regardless of the provider's native wire protocol.
//! - [`Activity`] — a human-visible unit posted back to the originating
//!   surface by an activity sink.
//!
//! The data flow is one-directional:
//!
//! ```text
//! Transport ──InboundEvent──► Router ──intent──► Dispatcher
//!                                                    │
//! Surface ◄──Activity── Sink ◄──translate── AgentMessage ◄── Runner
//! ```
//!
//! All wire-facing enums use `serde(tag = "type", rename_all = "snake_case")`
//! so the JSON-lines session logs and admin responses stay stable.

mod activity;
mod event;
mod message;
mod session;

pub use activity::{Activity, ActivityKind, ActivitySignal};
pub use event::{Attachment, EventKind, InboundEvent, IssueRefs, SurfaceRefs, TransportKind};
pub use message::{
    AgentMessage, AssistantBlock, McpServerInfo, ResultError, ResultSuccess, SystemInit, ToolUse,
    Usage, UserContent,
};
pub use session::{SessionKey, SessionSnapshot, SessionState};
