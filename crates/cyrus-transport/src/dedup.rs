// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Sliding-window envelope dedup.
//!
//! Upstream surfaces retry webhook deliveries; every delivery reuses its
//! envelope id. The router keeps one window per worker and drops any
//! `(transport, envelope_id)` pair it has seen within the window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cyrus_protocol::TransportKind;

pub struct DedupWindow {
    window: Duration,
    seen: Mutex<HashMap<(TransportKind, String), Instant>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a delivery. Returns `true` the first time a key is seen within
    /// the window, `false` for duplicates.
    pub fn first_seen(&self, transport: TransportKind, envelope_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("dedup lock");
        let now = Instant::now();
        // Prune inline: the map stays bounded by webhook volume per window.
        seen.retain(|_, at| now.duration_since(*at) <= self.window);

        match seen.get(&(transport, envelope_id.to_string())) {
            Some(_) => false,
            None => {
                seen.insert((transport, envelope_id.to_string()), now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
