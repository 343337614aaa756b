// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-session log files.
//!
//! Each session writes two append-only files named after the session id:
//! `<id>.ndjson` records every raw provider line plus every canonical
//! message; `<id>.log` is a human-readable rendering for operators tailing a
//! session.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;

use cyrus_protocol::AgentMessage;

pub struct SessionLog {
    ndjson: std::fs::File,
    human: std::fs::File,
    ndjson_path: PathBuf,
}

impl SessionLog {
    pub fn create(dir: &Path, session_id: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log dir {}", dir.display()))?;
        let ndjson_path = dir.join(format!("{session_id}.ndjson"));
        let human_path = dir.join(format!("{session_id}.log"));
        let open = |p: &Path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("opening {}", p.display()))
        };
        Ok(Self {
            ndjson: open(&ndjson_path)?,
            human: open(&human_path)?,
            ndjson_path,
        })
    }

    pub fn ndjson_path(&self) -> &Path {
        &self.ndjson_path
    }

    /// Record a raw provider stdout line.
    pub fn raw_line(&mut self, line: &str) {
        let record = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "raw": line,
        });
        let _ = writeln!(self.ndjson, "{record}");
    }

    /// Record a canonical message in both files.
    pub fn message(&mut self, msg: &AgentMessage) {
        let record = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "message": msg,
        });
        let _ = writeln!(self.ndjson, "{record}");
        let _ = writeln!(self.human, "{}", render_human(msg));
    }

    /// Record a supervisor-level note (spawn, signal, exit status).
    pub fn note(&mut self, note: &str) {
        let record = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "note": note,
        });
        let _ = writeln!(self.ndjson, "{record}");
        let _ = writeln!(self.human, "[supervisor] {note}");
    }
}

fn render_human(msg: &AgentMessage) -> String {
    match msg {
        AgentMessage::SystemInit(init) => format!(
            "[init] session={} model={} cwd={} tools={}",
            init.session_id,
            init.model,
            init.cwd,
            init.tools.len()
        ),
        AgentMessage::User { content, .. } => match content.as_text() {
            Some(t) => format!("[user] {}", first_line(t)),
            None => "[user] <structured blocks>".to_string(),
        },
        AgentMessage::Assistant { content, .. } => {
            let mut parts = Vec::new();
            for block in content {
                match block {
                    cyrus_protocol::AssistantBlock::Text { text } => {
                        parts.push(format!("[assistant] {}", first_line(text)));
                    }
                    cyrus_protocol::AssistantBlock::ToolUse(t) => {
                        parts.push(format!("[tool_use] {} id={}", t.name, t.id));
                    }
                }
            }
            parts.join("\n")
        }
        AgentMessage::ToolResult {
            tool_use_id,
            is_error,
            content,
        } => {
            let status = if *is_error { "error" } else { "ok" };
            format!(
                "[tool_result] id={tool_use_id} {status} {}",
                first_line(content)
            )
        }
        AgentMessage::ResultSuccess(r) => format!(
            "[result] success in {}ms ({} in / {} out tokens)",
            r.duration_ms, r.usage.input_tokens, r.usage.output_tokens
        ),
        AgentMessage::ResultError(r) => {
            format!("[result] error in {}ms: {}", r.duration_ms, r.errors.join("; "))
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

// ── Unit tests ────────────────────────────────────────────────────────────────
