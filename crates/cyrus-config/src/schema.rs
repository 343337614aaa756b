// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The persisted configuration document.
//!
//! The on-disk format is a single JSON file under the cyrus home directory.
//! Unknown keys — at the top level and inside each repository — are captured
//! in flattened maps and written back verbatim on save, so newer fields
//! survive a round trip through an older worker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` falls back to `false`, so fields that
/// should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_active_sessions() -> usize {
    3
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_burst_window_ms() -> u64 {
    2000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_backup_retention() -> usize {
    10
}

/// Validation failures for a candidate config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("repository #{index} is missing a non-empty `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate repository id {0:?}")]
    DuplicateId(String),
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tool presets understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolPreset {
    /// Read and search tools only.
    ReadOnly,
    /// Read/search plus non-destructive edits.
    Safe,
    /// Everything the runner offers.
    All,
    /// The orchestrator set: task/todo management plus read-only.
    Coordinator,
}

/// Either a named preset or an explicit tool list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolPolicy {
    Preset(ToolPreset),
    Explicit(Vec<String>),
}

impl Default for ToolPolicy {
    fn default() -> Self {
        ToolPolicy::Preset(ToolPreset::Safe)
    }
}

/// Declarative mapping from issue labels to a system prompt and tool policy.
///
/// A rule with no `prompt_path` refers to a built-in template of the same
/// name; one with a path loads the prompt from that file (absolute, relative
/// to the prompts dir, or `~`-prefixed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRule {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<ToolPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_path: Option<String>,
}

impl PromptRule {
    /// Built-in templates are exactly the rules without a custom prompt file.
    pub fn is_builtin(&self) -> bool {
        self.prompt_path.is_none()
    }

    /// Case-insensitive label match.
    pub fn matches_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// One configured repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    /// Absolute path to the checkout workspaces derive from.
    pub repository_path: String,
    #[serde(default)]
    pub base_branch: String,
    pub linear_workspace_id: String,
    #[serde(default)]
    pub linear_workspace_name: String,
    pub linear_token: String,
    /// promptName → rule. BTreeMap keeps save output stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_prompts: BTreeMap<String, PromptRule>,
    /// Default tool policy when no prompt rule overrides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<ToolPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    /// Tracker team keys that route to this repository.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub team_keys: Vec<String>,
    /// Chat channel ids that route to this repository.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_bindings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Unknown keys, preserved verbatim across load/save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Worker tuning knobs. All have conservative defaults; the section may be
/// absent from the file entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// At most this many concurrently active sessions per repository.
    pub max_active_sessions: usize,
    /// Sliding window for webhook dedup, seconds.
    pub dedup_window_secs: u64,
    /// Prompts arriving within this window are merged into one stream message.
    pub burst_window_ms: u64,
    /// Graceful-shutdown drain budget, seconds.
    pub shutdown_grace_secs: u64,
    /// Stop an idle runner after this many seconds of stream silence.
    /// `None` disables the idle timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Create per-issue git worktrees instead of plain directories.
    pub use_worktrees: bool,
    /// How many config backups to keep.
    pub backup_retention: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_active_sessions: default_max_active_sessions(),
            dedup_window_secs: default_dedup_window_secs(),
            burst_window_ms: default_burst_window_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            idle_timeout_secs: None,
            use_worktrees: true,
            backup_retention: default_backup_retention(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub repositories: Vec<Repository>,
    /// Global fallback prompt rules, keyed by prompt name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prompt_defaults: BTreeMap<String, PromptRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ngrok_auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_legacy: bool,
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Unknown top-level keys, preserved verbatim across load/save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    /// Validate the structural rules every published config must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for (index, repo) in self.repositories.iter().enumerate() {
            for (field, value) in [
                ("id", &repo.id),
                ("name", &repo.name),
                ("repositoryPath", &repo.repository_path),
                ("linearToken", &repo.linear_token),
                ("linearWorkspaceId", &repo.linear_workspace_id),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::MissingField { index, field });
                }
            }
            if !seen.insert(repo.id.clone()) {
                return Err(ConfigError::DuplicateId(repo.id.clone()));
            }
        }
        Ok(())
    }

    pub fn repository(&self, id: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.id == id)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
