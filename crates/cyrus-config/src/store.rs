// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! On-disk persistence for the configuration document.
//!
//! # Atomicity
//!
//! Saves write to `<path>.tmp`, fsync, then rename over the target. A crash
//! mid-save leaves either the old file or the new file, never a torn one.
//!
//! # Backups
//!
//! Before each overwrite the previous file is copied to
//! `backups/config-v<version>-<timestamp>.json` next to the config file.
//! Only the newest `retention` backups (by mtime) are kept.
//!
//! Serialization is deterministic — struct fields in declaration order,
//! unknown keys sorted — so save-then-load-then-save is byte-stable.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::schema::Config;

pub struct ConfigStore {
    path: PathBuf,
    backups_dir: PathBuf,
    retention: usize,
    version: std::sync::atomic::AtomicU64,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, retention: usize) -> Self {
        let path = path.into();
        let backups_dir = path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));
        Self {
            path,
            backups_dir,
            retention,
            version: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read and parse the config file. Does not validate.
    pub fn load(&self) -> anyhow::Result<Config> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(config)
    }

    /// Persist `config` atomically, taking a backup of the previous file.
    pub fn save(&self, config: &Config) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        if self.path.is_file() {
            if let Err(e) = self.backup_current() {
                // A failed backup must not block the save itself.
                warn!("config backup failed: {e:#}");
            }
        }

        let json = serde_json::to_string_pretty(config).context("serializing config")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            f.write_all(json.as_bytes())?;
            f.write_all(b"\n")?;
            f.sync_all().context("fsync of temp config")?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;

        self.version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        debug!(path = %self.path.display(), "config saved");
        Ok(())
    }

    fn backup_current(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.backups_dir)
            .with_context(|| format!("creating {}", self.backups_dir.display()))?;
        let version = self.version.load(std::sync::atomic::Ordering::SeqCst);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let name = format!("config-v{version}-{stamp}.json");
        fs::copy(&self.path, self.backups_dir.join(&name))
            .with_context(|| format!("copying backup {name}"))?;
        self.prune_backups();
        Ok(())
    }

    /// Delete all but the newest `retention` backups, by mtime.
    fn prune_backups(&self) {
        let Ok(entries) = fs::read_dir(&self.backups_dir) else {
            return;
        };
        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("config-v")
            })
            .filter_map(|e| {
                let mtime = e.metadata().ok()?.modified().ok()?;
                Some((mtime, e.path()))
            })
            .collect();
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in backups.into_iter().skip(self.retention) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), "could not prune backup: {e}");
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
