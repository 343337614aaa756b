// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Inbound event transports.
//!
//! A transport owns one webhook surface: it registers its paths on the
//! shared application server, authenticates each request (HMAC or Bearer,
//! always fail-closed), normalises the payload into a
//! [`cyrus_protocol::InboundEvent`], and forwards it on the shared event
//! channel. Everything behind the channel is surface-agnostic.
//!
//! Verification modes:
//!
//! - **HMAC-with-timestamp** (direct webhooks): base string
//!   `v0:<timestamp>:<raw-body>`, signature `v0=<lower-hex HMAC-SHA256>`,
//!   constant-time comparison, ±5 minute replay window.
//! - **Bearer** (behind a forwarding proxy): `Authorization: Bearer
//!   <shared-secret>`, constant-time comparison.

mod chat;
mod codehost;
mod dedup;
mod tracker;
mod verify;

pub use chat::ChatMentionTransport;
pub use codehost::CodeHostTransport;
pub use dedup::DedupWindow;
pub use tracker::TrackerWebhookTransport;
pub use verify::{
    verify_bearer, verify_plain_hmac, verify_signed_request, VerifyError, VerifyMode,
};

use cyrus_protocol::TransportKind;

/// One inbound event source, mountable on the shared server.
pub trait EventTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// The path this transport serves, e.g. `/webhook`.
    fn path(&self) -> &str;

    /// Build the axum sub-router (with its own state) for [`Self::path`].
    fn router(&self) -> axum::Router;
}

/// The shared success body every accepted webhook returns.
pub(crate) fn accepted() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "success": true }))
}
