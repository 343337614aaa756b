// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Live configuration ownership and hot reload.
//!
//! # Design
//!
//! ```text
//!   file watcher ──debounce──► reload() ──validate──► diff ──► broadcast
//!        ▲                                                        │
//!        │  ignore_next_watch                                     ▼
//!   update()/rollback() ──save──► disk            EdgeWorker apply/rollback
//! ```
//!
//! The manager is the single writer. Every mutation goes through it:
//! validate → persist atomically → publish an [`ConfigEvent::Reloaded`] with
//! the old/new diff. Readers hold `Arc<Config>` snapshots and never observe
//! a partially applied change.
//!
//! When a listener fails to hot-apply a published config it calls
//! [`ConfigManager::rollback`], which restores the previous snapshot both in
//! memory and on disk (suppressing the watch event its own write causes).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::schema::{Config, Repository};
use crate::store::ConfigStore;

/// How long the file must stay quiet before a watch-triggered reload.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Difference between two configs, repository-id granular.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    /// Any top-level field outside `repositories` differs.
    pub other_changes: bool,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && !self.other_changes
    }

    /// Compute the diff between two configs.
    pub fn between(old: &Config, new: &Config) -> Self {
        let old_map: std::collections::HashMap<&str, &Repository> =
            old.repositories.iter().map(|r| (r.id.as_str(), r)).collect();
        let new_map: std::collections::HashMap<&str, &Repository> =
            new.repositories.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for repo in &new.repositories {
            match old_map.get(repo.id.as_str()) {
                None => added.push(repo.id.clone()),
                Some(prev) if *prev != repo => modified.push(repo.id.clone()),
                Some(_) => {}
            }
        }
        let removed: Vec<String> = old
            .repositories
            .iter()
            .filter(|r| !new_map.contains_key(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();

        // Compare everything except `repositories` by erasing that field.
        let strip = |c: &Config| {
            let mut v = serde_json::to_value(c).unwrap_or_default();
            if let Some(obj) = v.as_object_mut() {
                obj.remove("repositories");
            }
            v
        };
        let other_changes = strip(old) != strip(new);

        Self {
            added,
            removed,
            modified,
            other_changes,
        }
    }
}

/// Published configuration changes.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A validated config was persisted and is now active.
    Reloaded {
        config: Arc<Config>,
        diff: ConfigDiff,
    },
    /// A candidate config was rejected; the previous one stays active.
    Error { message: String },
    /// A listener failed to apply a change and the previous config was
    /// restored in memory and on disk.
    RolledBack { reason: String },
}

/// Owns the active config. Single writer; see module docs.
pub struct ConfigManager {
    store: ConfigStore,
    active: RwLock<Arc<Config>>,
    previous: RwLock<Option<Arc<Config>>>,
    event_tx: broadcast::Sender<ConfigEvent>,
    /// Set before our own disk writes so the watcher skips the echo.
    ignore_next_watch: Arc<AtomicBool>,
}

impl ConfigManager {
    /// Load the config from `store` (or start from defaults when the file
    /// does not exist yet) and construct the manager.
    pub fn new(store: ConfigStore) -> anyhow::Result<Self> {
        let config = if store.exists() {
            let cfg = store.load()?;
            cfg.validate()?;
            cfg
        } else {
            Config::default()
        };
        let (event_tx, _) = broadcast::channel(64);
        Ok(Self {
            store,
            active: RwLock::new(Arc::new(config)),
            previous: RwLock::new(None),
            event_tx,
            ignore_next_watch: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The active config snapshot.
    pub fn get(&self) -> Arc<Config> {
        self.active.read().expect("config lock poisoned").clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_tx.subscribe()
    }

    /// Merge `partial` into the active config, validate, persist, publish.
    ///
    /// `partial` is a JSON object; object values merge recursively, scalars
    /// and arrays replace. `update(partial)` followed by `update({})` is
    /// equivalent to `update(partial)` alone.
    pub fn update(&self, partial: serde_json::Value) -> anyhow::Result<Arc<Config>> {
        let current = self.get();
        let mut merged = serde_json::to_value(current.as_ref())?;
        merge_json(&mut merged, partial);
        let candidate: Config = serde_json::from_value(merged)?;
        self.publish(candidate)
    }

    pub fn add_repository(&self, repo: Repository) -> anyhow::Result<Arc<Config>> {
        let current = self.get();
        if current.repository(&repo.id).is_some() {
            anyhow::bail!("repository {:?} already exists", repo.id);
        }
        let mut next = current.as_ref().clone();
        next.repositories.push(repo);
        self.publish(next)
    }

    pub fn remove_repository(&self, id: &str) -> anyhow::Result<Arc<Config>> {
        let current = self.get();
        let mut next = current.as_ref().clone();
        let before = next.repositories.len();
        next.repositories.retain(|r| r.id != id);
        if next.repositories.len() == before {
            anyhow::bail!("repository {id:?} not found");
        }
        self.publish(next)
    }

    pub fn update_repository(&self, repo: Repository) -> anyhow::Result<Arc<Config>> {
        let current = self.get();
        let mut next = current.as_ref().clone();
        let slot = next
            .repositories
            .iter_mut()
            .find(|r| r.id == repo.id)
            .ok_or_else(|| anyhow::anyhow!("repository {:?} not found", repo.id))?;
        *slot = repo;
        self.publish(next)
    }

    /// Replace the whole config (validate, persist, publish). Unlike
    /// [`ConfigManager::update`] this does not merge, so callers can delete
    /// keys — the prompt-plan apply path relies on that.
    pub fn replace(&self, config: Config) -> anyhow::Result<Arc<Config>> {
        self.publish(config)
    }

    /// Force a reread from disk. Invalid content leaves the active config in
    /// place and emits [`ConfigEvent::Error`].
    pub fn reload(&self) -> anyhow::Result<()> {
        let candidate = match self.store.load() {
            Ok(c) => c,
            Err(e) => {
                let message = format!("config reload failed: {e:#}");
                warn!("{message}");
                let _ = self.event_tx.send(ConfigEvent::Error { message });
                return Ok(());
            }
        };
        if let Err(e) = candidate.validate() {
            let message = format!("config reload rejected: {e}");
            warn!("{message}");
            let _ = self.event_tx.send(ConfigEvent::Error { message });
            return Ok(());
        }

        let old = self.get();
        let diff = ConfigDiff::between(&old, &candidate);
        if diff.is_empty() {
            debug!("config reload: no changes");
            return Ok(());
        }
        let next = Arc::new(candidate);
        *self.previous.write().expect("config lock poisoned") = Some(old);
        *self.active.write().expect("config lock poisoned") = next.clone();
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "config reloaded from disk"
        );
        let _ = self.event_tx.send(ConfigEvent::Reloaded { config: next, diff });
        Ok(())
    }

    /// Restore the previous config in memory and on disk.
    ///
    /// Used by listeners whose `Reloaded` handler failed. The disk write is
    /// flagged so the watcher does not re-trigger a reload from our own echo.
    pub fn rollback(&self, reason: impl Into<String>) -> anyhow::Result<()> {
        let reason = reason.into();
        let Some(prev) = self.previous.write().expect("config lock poisoned").take() else {
            anyhow::bail!("no previous config to roll back to");
        };
        self.ignore_next_watch.store(true, Ordering::SeqCst);
        self.store.save(&prev)?;
        *self.active.write().expect("config lock poisoned") = prev;
        error!("config rolled back: {reason}");
        let _ = self.event_tx.send(ConfigEvent::RolledBack { reason });
        Ok(())
    }

    /// Validate, persist, swap, publish. The write path for all mutators.
    fn publish(&self, candidate: Config) -> anyhow::Result<Arc<Config>> {
        candidate.validate()?;
        let old = self.get();
        let diff = ConfigDiff::between(&old, &candidate);

        self.ignore_next_watch.store(true, Ordering::SeqCst);
        self.store.save(&candidate)?;

        let next = Arc::new(candidate);
        *self.previous.write().expect("config lock poisoned") = Some(old);
        *self.active.write().expect("config lock poisoned") = next.clone();
        if !diff.is_empty() {
            let _ = self.event_tx.send(ConfigEvent::Reloaded {
                config: next.clone(),
                diff,
            });
        }
        Ok(next)
    }

    /// Watch the config file and reload after changes stabilise for
    /// [`WATCH_DEBOUNCE`]. Runs until the manager is dropped.
    ///
    /// Events caused by the manager's own saves are suppressed via the
    /// `ignore_next_watch` flag.
    pub fn start_watching(self: &Arc<Self>) -> anyhow::Result<()> {
        // Saves made before the watcher existed have no echo to suppress.
        self.ignore_next_watch.store(false, Ordering::SeqCst);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let path = self.store.path().to_path_buf();

        // notify delivers on its own thread; forward into the tokio world.
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = raw_tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!("config watcher error: {e}"),
            }
        })?;
        // Watch the parent directory: editors that replace-by-rename would
        // otherwise detach a file-level watch.
        let watch_target = path.parent().unwrap_or(std::path::Path::new("."));
        watcher.watch(watch_target, RecursiveMode::NonRecursive)?;

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            // Keep the watcher alive for the task's lifetime.
            let _watcher = watcher;
            while raw_rx.recv().await.is_some() {
                // Debounce: absorb further events until the file is quiet.
                loop {
                    match tokio::time::timeout(WATCH_DEBOUNCE, raw_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                let Some(manager) = manager.upgrade() else { return };
                if manager.ignore_next_watch.swap(false, Ordering::SeqCst) {
                    debug!("config watch: ignoring our own save");
                    continue;
                }
                if let Err(e) = manager.reload() {
                    warn!("config watch reload failed: {e:#}");
                }
            }
        });
        info!(path = %path.display(), "config file watch started");
        Ok(())
    }
}

/// Deep-merge `src` into `dst`; `src` wins on scalar and array conflicts.
fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                merge_json(d.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
