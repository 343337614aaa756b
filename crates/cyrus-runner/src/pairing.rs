// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tool-call / tool-result pairing.
//!
//! Providers differ in how (and whether) they thread call ids. This tracker
//! gives every tool use a session-unique id, remembers which are still
//! outstanding, and can close them all with synthetic error results when the
//! process dies mid-call.

use std::collections::VecDeque;

use rand::Rng;

/// One tool call awaiting its result.
#[derive(Debug, Clone)]
struct Outstanding {
    id: String,
    name: String,
}

#[derive(Debug, Default)]
pub struct ToolPairing {
    /// FIFO of calls without results yet, in emission order.
    outstanding: VecDeque<Outstanding>,
    /// Every id handed out this session, for uniqueness.
    emitted: std::collections::HashSet<String>,
    seq: u64,
}

impl ToolPairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool call, generating an id when the provider omitted one.
    /// Returns the id to thread into the canonical `tool_use`.
    pub fn register_call(&mut self, provider_id: Option<String>, name: &str) -> String {
        let id = match provider_id {
            Some(id) if !id.is_empty() && !self.emitted.contains(&id) => id,
            _ => self.generate_id(name),
        };
        self.emitted.insert(id.clone());
        self.outstanding.push_back(Outstanding {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    /// Resolve a result to its call id.
    ///
    /// Matching order: explicit id, then the oldest outstanding call with the
    /// same tool name, then the oldest outstanding call of any name. Returns
    /// `None` for orphan results (result without a recorded call).
    pub fn resolve_result(&mut self, id: Option<&str>, name: Option<&str>) -> Option<String> {
        let pos = if let Some(id) = id {
            self.outstanding.iter().position(|o| o.id == id)?
        } else if let Some(name) = name {
            self.outstanding
                .iter()
                .position(|o| o.name == name)
                .or(if self.outstanding.is_empty() { None } else { Some(0) })?
        } else if self.outstanding.is_empty() {
            return None;
        } else {
            0
        };
        self.outstanding.remove(pos).map(|o| o.id)
    }

    /// Drain every unresolved call — used when the subprocess exits before
    /// delivering results. Returns `(id, name)` pairs in emission order.
    pub fn drain_outstanding(&mut self) -> Vec<(String, String)> {
        self.outstanding
            .drain(..)
            .map(|o| (o.id, o.name))
            .collect()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    fn generate_id(&mut self, name: &str) -> String {
        self.seq += 1;
        let rand: u32 = rand::thread_rng().gen_range(0x1000..0xffff);
        format!("{name}-{}-{rand:x}", self.seq)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
