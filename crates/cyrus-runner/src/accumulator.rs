// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Delta accumulation for providers that stream prose in fragments.

use crate::adapter::TextRole;

/// Accumulates consecutive same-role text deltas into one complete message.
///
/// Invariant: the buffer is non-empty only between consecutive deltas of the
/// same role. A role change, a non-delta event, or an explicit flush empties
/// it.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    role: Option<TextRole>,
    buffer: String,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Feed one delta. Returns the finished `(role, text)` of the *previous*
    /// run when `role` differs from the accumulating one.
    pub fn push(&mut self, role: TextRole, text: &str) -> Option<(TextRole, String)> {
        let flushed = match self.role {
            Some(current) if current != role => self.flush(),
            _ => None,
        };
        self.role = Some(role);
        self.buffer.push_str(text);
        flushed
    }

    /// Empty the buffer, returning the accumulated run if there was one.
    pub fn flush(&mut self) -> Option<(TextRole, String)> {
        if self.buffer.is_empty() {
            self.role = None;
            return None;
        }
        let role = self.role.take()?;
        Some((role, std::mem::take(&mut self.buffer)))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
