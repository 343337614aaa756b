// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The adapter seam between a provider's native stream and the supervisor.
//!
//! An adapter owns no IO: the supervisor hands it one stdout line at a time
//! and receives zero or more [`ProviderEvent`]s. The supervisor then runs
//! the dialect-independent normalisation (init synthesis, delta
//! accumulation, tool pairing) on those events.

use cyrus_protocol::{SystemInit, Usage};

/// Which side of the conversation a text event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRole {
    User,
    Assistant,
}

/// One semantic event extracted from a provider stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Session bootstrap. Providers that never send one get a synthesised
    /// init from the supervisor.
    Init(SystemInit),
    /// The provider's session token arrived separately from init.
    SessionId(String),
    /// A chunk of prose. `delta` text accumulates with adjacent chunks of
    /// the same role; non-delta text flushes as a complete message.
    Text {
        role: TextRole,
        text: String,
        delta: bool,
    },
    /// A structured tool invocation. `id` is `None` for providers that do
    /// not thread call ids; the pairing layer assigns one.
    ToolCall {
        id: Option<String>,
        name: String,
        input: serde_json::Value,
    },
    /// A tool completion. Matched to its call by `id`, or FIFO per `name`
    /// when the provider omits ids.
    ToolResult {
        id: Option<String>,
        name: Option<String>,
        content: String,
        is_error: bool,
    },
    /// Token accounting update; folded into the terminal result.
    Usage(Usage),
    /// Provider-reported successful completion of the whole run.
    Completed { last_text: Option<String> },
    /// Provider-reported failure.
    Errored { message: String },
    /// Parsed but irrelevant to the canonical stream (heartbeats, status).
    Ignored,
}

/// A provider stream dialect.
///
/// `parse_line` must be infallible in the sense that malformed lines are
/// reported as [`ProviderEvent::Ignored`] (and logged) rather than aborting
/// the stream — agent CLIs interleave diagnostics with protocol output.
pub trait StreamAdapter: Send {
    /// Extra command-line arguments that switch the provider CLI into its
    /// machine-readable streaming mode.
    fn protocol_args(&self, streaming_input: bool) -> Vec<String>;

    /// Parse one stdout line into semantic events.
    fn parse_line(&mut self, line: &str) -> Vec<ProviderEvent>;

    /// Encode a user prompt for the provider's stdin, including the trailing
    /// newline when the dialect is line-delimited.
    fn encode_prompt(&self, text: &str) -> String;
}
