// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-issue workspace directories.
//!
//! A session's workspace is `<repository_path>-<issue_key>`. When worktree
//! policy is on and the repository is a git checkout, the workspace is a
//! git worktree on a fresh `cyrus/<issue-key>` branch off the base branch;
//! otherwise it is a plain directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    use_worktrees: bool,
}

impl WorkspaceManager {
    pub fn new(use_worktrees: bool) -> Self {
        Self { use_worktrees }
    }

    /// The workspace path for an issue, independent of whether it exists.
    pub fn path_for(repository_path: &str, issue_key: &str) -> PathBuf {
        PathBuf::from(format!("{repository_path}-{issue_key}"))
    }

    /// Create (or reuse) the workspace for an issue.
    pub async fn prepare(
        &self,
        repository_path: &str,
        base_branch: &str,
        issue_key: &str,
    ) -> anyhow::Result<PathBuf> {
        let workspace = Self::path_for(repository_path, issue_key);
        if workspace.exists() {
            debug!(path = %workspace.display(), "reusing existing workspace");
            return Ok(workspace);
        }

        if self.use_worktrees && Path::new(repository_path).join(".git").exists() {
            match self
                .add_worktree(repository_path, base_branch, issue_key, &workspace)
                .await
            {
                Ok(()) => return Ok(workspace),
                Err(e) => {
                    // A broken worktree setup must not block the session.
                    warn!("worktree creation failed, falling back to plain dir: {e:#}");
                }
            }
        }

        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace {}", workspace.display()))?;
        Ok(workspace)
    }

    async fn add_worktree(
        &self,
        repository_path: &str,
        base_branch: &str,
        issue_key: &str,
        workspace: &Path,
    ) -> anyhow::Result<()> {
        let branch = format!("cyrus/{}", issue_key.to_lowercase());
        let base = if base_branch.is_empty() { "HEAD" } else { base_branch };
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(repository_path)
            .args(["worktree", "add", "-b", &branch])
            .arg(workspace)
            .arg(base)
            .output()
            .await
            .context("running git worktree add")?;
        if !output.status.success() {
            anyhow::bail!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(branch, path = %workspace.display(), "worktree created");
        Ok(())
    }

    /// Drop a session's worktree registration. Plain directories are left
    /// in place for postmortems.
    pub async fn release(&self, repository_path: &str, workspace: &Path) {
        if !self.use_worktrees {
            return;
        }
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(repository_path)
            .args(["worktree", "remove", "--force"])
            .arg(workspace)
            .output()
            .await;
        match output {
            Ok(o) if o.status.success() => {
                debug!(path = %workspace.display(), "worktree removed");
            }
            Ok(o) => debug!(
                "worktree remove skipped: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            ),
            Err(e) => debug!("worktree remove skipped: {e}"),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
