// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tool-call rendering for surfaces.
//!
//! Each runner supplies a formatter; the sink combines `action_name` +
//! `parameter` into the ephemeral "working…" activity and replaces it with
//! `result` when the tool completes. Formatters are pure.

use std::sync::Arc;

use serde_json::Value;

pub trait MessageFormatter: Send + Sync {
    /// Short verb phrase, e.g. `Reading file` or `Running command`.
    fn action_name(&self, tool: &str, input: &Value, is_error: bool) -> String;

    /// The salient argument, e.g. the file path or the command line.
    fn parameter(&self, tool: &str, input: &Value) -> String;

    /// Markdown rendering of the tool result.
    fn result(&self, tool: &str, input: &Value, raw: &str, is_error: bool) -> String;
}

/// Fallback rendering shared by all provider formatters.
pub fn plain_formatter() -> Arc<dyn MessageFormatter> {
    Arc::new(PlainFormatter)
}

pub(crate) struct PlainFormatter;

impl MessageFormatter for PlainFormatter {
    fn action_name(&self, tool: &str, _input: &Value, is_error: bool) -> String {
        if is_error {
            format!("{tool} failed")
        } else {
            format!("Using {tool}")
        }
    }

    fn parameter(&self, _tool: &str, input: &Value) -> String {
        // Pick the most path-or-command-looking string argument.
        for key in ["path", "file_path", "command", "query", "pattern", "url"] {
            if let Some(v) = input.get(key).and_then(|v| v.as_str()) {
                return format!("`{v}`");
            }
        }
        match input {
            Value::Object(o) if o.is_empty() => String::new(),
            Value::Null => String::new(),
            other => format!("`{}`", truncate(&other.to_string(), 120)),
        }
    }

    fn result(&self, _tool: &str, _input: &Value, raw: &str, is_error: bool) -> String {
        let body = truncate(raw.trim_end(), 4000);
        if body.is_empty() {
            return if is_error { "(failed with no output)".into() } else { "(no output)".into() };
        }
        format!("```\n{body}\n```")
    }
}

/// Truncate to `max` characters on a char boundary, appending an ellipsis.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}

// ── Unit tests ────────────────────────────────────────────────────────────────
