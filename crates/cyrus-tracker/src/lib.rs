// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod client;
mod sink;
mod types;

pub use client::{HttpTracker, IssueTracker, TrackerError};
pub use sink::{ActivitySink, RecordingSink, SinkError, TrackerSink};
pub use types::{Comment, Issue, Label, Team, TrackerUser, WorkflowState};
