// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Typed snapshot of the process environment.
//!
//! Environment variables are read exactly once at startup into [`CyrusEnv`];
//! nothing deeper in the worker touches `std::env`. Refreshing a secret is
//! an explicit admin operation that rewrites `<cyrus_home>/.env` — the new
//! value takes effect on the next start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// All environment variables the worker consumes.
#[derive(Debug, Clone)]
pub struct CyrusEnv {
    /// Root for config, prompts, logs, and `.env`. Defaults to `~/.cyrus`.
    pub cyrus_home: PathBuf,
    /// Public base URL used when registering webhooks.
    pub base_url: Option<String>,
    /// Externally visible host override for the shared listener.
    pub host_external: Option<String>,
    pub cloudflare_token: Option<String>,
    /// When set, webhooks arrive pre-verified through the proxy and carry a
    /// Bearer secret instead of an HMAC signature.
    pub proxy_url: Option<String>,
    pub linear_api_token: Option<String>,
    pub slack_bot_token: Option<String>,
    /// Opt-in for the `/github-token` admin endpoint.
    pub manage_gh_auth: bool,
}

impl CyrusEnv {
    /// Read the environment once. Never fails: unset optionals stay `None`.
    pub fn load() -> Self {
        let cyrus_home = std::env::var("CYRUS_HOME")
            .ok()
            .map(|raw| PathBuf::from(shellexpand::tilde(&raw).into_owned()))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".cyrus")
            });
        Self {
            cyrus_home,
            base_url: non_empty_var("CYRUS_BASE_URL"),
            host_external: non_empty_var("CYRUS_HOST_EXTERNAL"),
            cloudflare_token: non_empty_var("CLOUDFLARE_TOKEN"),
            proxy_url: non_empty_var("PROXY_URL"),
            linear_api_token: non_empty_var("LINEAR_API_TOKEN"),
            slack_bot_token: non_empty_var("SLACK_BOT_TOKEN"),
            manage_gh_auth: non_empty_var("MANAGE_GH_AUTH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.cyrus_home.join("config.json")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.cyrus_home.join("prompts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.cyrus_home.join("logs")
    }

    pub fn env_file(&self) -> PathBuf {
        self.cyrus_home.join(".env")
    }

    /// Merge `updates` into `<cyrus_home>/.env`, creating it when absent.
    ///
    /// The file is written with mode 0o600; keys sort lexically so repeated
    /// writes are stable.
    pub fn persist_env_vars(
        &self,
        updates: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let path = self.env_file();
        let mut vars = read_env_file(&path)?;
        for (k, v) in updates {
            vars.insert(k.clone(), v.clone());
        }
        let mut out = String::new();
        for (k, v) in &vars {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        write_secret_file(&path, out.as_bytes())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_env_file(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if !path.is_file() {
        return Ok(vars);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            vars.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    Ok(vars)
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

/// Mask a secret for display: all but the last 4 characters become `*`,
/// rendered as a fixed `****` prefix. Values of ≤4 characters are fully
/// masked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

// ── Unit tests ────────────────────────────────────────────────────────────────
