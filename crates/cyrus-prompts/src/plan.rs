// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pure prompt-plan construction.
//!
//! The CLI's `prompts create|edit|delete` subcommands never mutate anything
//! directly. Each builds a [`PromptPlan`] — the next config, the file
//! operation, warnings, and label conflicts — which the caller can show to
//! the operator and then apply. Building a plan only probes the filesystem
//! read-only; applying it is the caller's job.

use std::path::{Path, PathBuf};

use cyrus_config::{Config, PromptRule};

use crate::templates::is_builtin_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Edit,
    Delete,
}

/// Where the rule lives: the global defaults or one repository's map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanScope {
    Global,
    Repository(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpKind {
    Create,
    Update,
    Delete,
    None,
}

/// The single file operation a plan implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOp {
    pub kind: FileOpKind,
    pub path: Option<PathBuf>,
    pub next_content: Option<String>,
    pub previous_content: Option<String>,
}

impl FileOp {
    fn none() -> Self {
        Self {
            kind: FileOpKind::None,
            path: None,
            next_content: None,
            previous_content: None,
        }
    }
}

/// A label claimed by a sibling prompt in the same scope. Surfaced, never
/// fatal — the router resolves overlaps deterministically at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelConflict {
    pub label: String,
    pub claimed_by: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("prompt name normalises to nothing")]
    EmptyName,
    #[error("{0:?} is a built-in template name")]
    BuiltinCollision(String),
    #[error("prompt {0:?} already exists in this scope")]
    NameTaken(String),
    #[error("prompt {0:?} does not exist in this scope")]
    NotFound(String),
    #[error("built-in prompt {0:?} allows label edits only")]
    BuiltinImmutable(String),
    #[error("prompt file {0} already exists")]
    FileExists(PathBuf),
    #[error("unknown repository {0:?}")]
    UnknownRepository(String),
}

/// The result of planning: everything needed to preview and apply a change.
#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub action: PlanAction,
    pub scope: PlanScope,
    pub prompt_name: String,
    pub labels: Vec<String>,
    pub prompt_path: Option<String>,
    pub file_op: FileOp,
    pub warnings: Vec<String>,
    pub conflicts: Vec<LabelConflict>,
    pub next_config: Config,
}

/// Normalise a prompt name: lowercase, runs of non-alphanumerics collapse to
/// a single `-`, leading/trailing `-` stripped.
pub fn normalize_name(raw: &str) -> Result<String, PlanError> {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        return Err(PlanError::EmptyName);
    }
    Ok(out)
}

/// Dedup labels case-insensitively, preserving first-seen casing. Returns
/// the surviving labels and a warning per dropped duplicate.
fn dedup_labels(labels: &[String]) -> (Vec<String>, Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::new();
    let mut warnings = Vec::new();
    for label in labels {
        let folded = label.to_lowercase();
        if seen.insert(folded) {
            kept.push(label.clone());
        } else {
            warnings.push(format!("duplicate label {label:?} removed"));
        }
    }
    (kept, warnings)
}

/// Labels in `labels` that sibling rules in the same scope already claim.
fn sibling_conflicts(
    rules: &std::collections::BTreeMap<String, PromptRule>,
    own_name: &str,
    labels: &[String],
) -> Vec<LabelConflict> {
    let mut conflicts = Vec::new();
    for (name, rule) in rules {
        if name == own_name {
            continue;
        }
        for label in labels {
            if rule.matches_label(label) {
                conflicts.push(LabelConflict {
                    label: label.clone(),
                    claimed_by: name.clone(),
                });
            }
        }
    }
    conflicts
}

fn scope_rules<'a>(
    config: &'a Config,
    scope: &PlanScope,
) -> Result<&'a std::collections::BTreeMap<String, PromptRule>, PlanError> {
    match scope {
        PlanScope::Global => Ok(&config.prompt_defaults),
        PlanScope::Repository(id) => config
            .repository(id)
            .map(|r| &r.label_prompts)
            .ok_or_else(|| PlanError::UnknownRepository(id.clone())),
    }
}

fn scope_rules_mut<'a>(
    config: &'a mut Config,
    scope: &PlanScope,
) -> &'a mut std::collections::BTreeMap<String, PromptRule> {
    match scope {
        PlanScope::Global => &mut config.prompt_defaults,
        PlanScope::Repository(id) => {
            let idx = config
                .repositories
                .iter()
                .position(|r| &r.id == id)
                .expect("scope validated before mutation");
            &mut config.repositories[idx].label_prompts
        }
    }
}

/// File name for a generated prompt: `custom-<name>[-<repo-slug>].md`.
fn prompt_file_name(name: &str, scope: &PlanScope) -> String {
    match scope {
        PlanScope::Global => format!("custom-{name}.md"),
        PlanScope::Repository(id) => {
            let slug = normalize_name(id).unwrap_or_else(|_| "repo".to_string());
            format!("custom-{name}-{slug}.md")
        }
    }
}

/// Plan the creation of a new custom prompt.
pub fn build_create_prompt_plan(
    config: &Config,
    scope: PlanScope,
    raw_name: &str,
    labels: &[String],
    content: &str,
    prompts_dir: &Path,
) -> Result<PromptPlan, PlanError> {
    let name = normalize_name(raw_name)?;
    if is_builtin_name(&name) {
        return Err(PlanError::BuiltinCollision(name));
    }
    let rules = scope_rules(config, &scope)?;
    if rules.contains_key(&name) {
        return Err(PlanError::NameTaken(name));
    }

    let (labels, warnings) = dedup_labels(labels);
    let conflicts = sibling_conflicts(rules, &name, &labels);

    let file_name = prompt_file_name(&name, &scope);
    let path = prompts_dir.join(&file_name);
    if path.exists() {
        return Err(PlanError::FileExists(path));
    }

    let mut next_config = config.clone();
    scope_rules_mut(&mut next_config, &scope).insert(
        name.clone(),
        PromptRule {
            labels: labels.clone(),
            prompt_path: Some(file_name.clone()),
            ..PromptRule::default()
        },
    );

    Ok(PromptPlan {
        action: PlanAction::Create,
        scope,
        prompt_name: name,
        labels,
        prompt_path: Some(file_name),
        file_op: FileOp {
            kind: FileOpKind::Create,
            path: Some(path),
            next_content: Some(content.to_string()),
            previous_content: None,
        },
        warnings,
        conflicts,
        next_config,
    })
}

/// Plan an edit of an existing prompt's labels and/or content.
///
/// Built-in prompts accept label edits only; passing `new_content` for one
/// is an error.
pub fn build_edit_prompt_plan(
    config: &Config,
    scope: PlanScope,
    raw_name: &str,
    labels: Option<&[String]>,
    new_content: Option<&str>,
    prompts_dir: &Path,
) -> Result<PromptPlan, PlanError> {
    let name = normalize_name(raw_name)?;
    let rules = scope_rules(config, &scope)?;
    let existing = rules.get(&name).ok_or(PlanError::NotFound(name.clone()))?;

    if existing.is_builtin() && new_content.is_some() {
        return Err(PlanError::BuiltinImmutable(name));
    }

    let (labels, warnings) = match labels {
        Some(l) => dedup_labels(l),
        None => (existing.labels.clone(), Vec::new()),
    };
    let conflicts = sibling_conflicts(rules, &name, &labels);

    let file_op = match (new_content, &existing.prompt_path) {
        (Some(content), Some(rel)) => {
            let expanded = shellexpand::tilde(rel).into_owned();
            let raw_path = Path::new(&expanded);
            let path = if raw_path.is_absolute() {
                raw_path.to_path_buf()
            } else {
                prompts_dir.join(raw_path)
            };
            let previous_content = std::fs::read_to_string(&path).ok();
            FileOp {
                kind: FileOpKind::Update,
                path: Some(path),
                next_content: Some(content.to_string()),
                previous_content,
            }
        }
        _ => FileOp::none(),
    };

    let prompt_path = existing.prompt_path.clone();
    let mut next_config = config.clone();
    if let Some(rule) = scope_rules_mut(&mut next_config, &scope).get_mut(&name) {
        rule.labels = labels.clone();
    }

    Ok(PromptPlan {
        action: PlanAction::Edit,
        scope,
        prompt_name: name,
        labels,
        prompt_path,
        file_op,
        warnings,
        conflicts,
        next_config,
    })
}

/// Plan the deletion of a custom prompt. Built-ins cannot be deleted.
pub fn build_delete_prompt_plan(
    config: &Config,
    scope: PlanScope,
    raw_name: &str,
    prompts_dir: &Path,
) -> Result<PromptPlan, PlanError> {
    let name = normalize_name(raw_name)?;
    let rules = scope_rules(config, &scope)?;
    let existing = rules.get(&name).ok_or(PlanError::NotFound(name.clone()))?;
    if existing.is_builtin() {
        return Err(PlanError::BuiltinImmutable(name));
    }

    let file_op = match &existing.prompt_path {
        Some(rel) => {
            let expanded = shellexpand::tilde(rel).into_owned();
            let raw_path = Path::new(&expanded);
            let path = if raw_path.is_absolute() {
                raw_path.to_path_buf()
            } else {
                prompts_dir.join(raw_path)
            };
            let previous_content = std::fs::read_to_string(&path).ok();
            FileOp {
                kind: FileOpKind::Delete,
                path: Some(path),
                next_content: None,
                previous_content,
            }
        }
        None => FileOp::none(),
    };

    let prompt_path = existing.prompt_path.clone();
    let mut next_config = config.clone();
    scope_rules_mut(&mut next_config, &scope).remove(&name);

    Ok(PromptPlan {
        action: PlanAction::Delete,
        scope,
        prompt_name: name,
        labels: Vec::new(),
        prompt_path,
        file_op,
        warnings: Vec::new(),
        conflicts: Vec::new(),
        next_config,
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_collapses_and_trims() {
        assert_eq!(normalize_name("My Cool Prompt!").unwrap(), "my-cool-prompt");
        assert_eq!(normalize_name("--weird__name--").unwrap(), "weird-name");
        assert_eq!(normalize_name("Simple").unwrap(), "simple");
        assert_eq!(normalize_name("!!!"), Err(PlanError::EmptyName));
    }

    #[test]
    fn create_rejects_builtin_names() {
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let err = build_create_prompt_plan(
            &cfg,
            PlanScope::Global,
            "Debugger",
            &[],
            "body",
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::BuiltinCollision("debugger".into()));
    }

    #[test]
    fn create_plans_file_and_rule() {
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let plan = build_create_prompt_plan(
            &cfg,
            PlanScope::Global,
            "Release Notes",
            &labels(&["docs", "Docs", "release"]),
            "Write the release notes.",
            dir.path(),
        )
        .unwrap();

        assert_eq!(plan.action, PlanAction::Create);
        assert_eq!(plan.prompt_name, "release-notes");
        assert_eq!(plan.labels, labels(&["docs", "release"]));
        assert_eq!(plan.warnings.len(), 1, "duplicate label warning");
        assert_eq!(plan.file_op.kind, FileOpKind::Create);
        assert_eq!(
            plan.prompt_path.as_deref(),
            Some("custom-release-notes.md")
        );
        assert!(plan
            .next_config
            .prompt_defaults
            .contains_key("release-notes"));
    }

    #[test]
    fn create_detects_file_collision() {
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom-x.md"), "old").unwrap();
        let err =
            build_create_prompt_plan(&cfg, PlanScope::Global, "x", &[], "new", dir.path())
                .unwrap_err();
        assert!(matches!(err, PlanError::FileExists(_)));
    }

    #[test]
    fn sibling_label_claims_are_conflicts_not_errors() {
        let mut cfg = Config::default();
        cfg.prompt_defaults.insert(
            "other".into(),
            PromptRule {
                labels: labels(&["Feature"]),
                prompt_path: Some("custom-other.md".into()),
                ..PromptRule::default()
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let plan = build_create_prompt_plan(
            &cfg,
            PlanScope::Global,
            "mine",
            &labels(&["feature"]),
            "body",
            dir.path(),
        )
        .unwrap();
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].claimed_by, "other");
    }

    #[test]
    fn edit_of_builtin_labels_is_allowed_content_is_not() {
        let mut cfg = Config::default();
        cfg.prompt_defaults
            .insert("debugger".into(), PromptRule::default());
        let dir = tempfile::tempdir().unwrap();

        let plan = build_edit_prompt_plan(
            &cfg,
            PlanScope::Global,
            "debugger",
            Some(&labels(&["bug"])),
            None,
            dir.path(),
        )
        .unwrap();
        assert_eq!(plan.action, PlanAction::Edit);
        assert_eq!(plan.file_op.kind, FileOpKind::None);

        let err = build_edit_prompt_plan(
            &cfg,
            PlanScope::Global,
            "debugger",
            None,
            Some("replacement"),
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::BuiltinImmutable("debugger".into()));
    }

    #[test]
    fn delete_refuses_builtin_and_removes_custom() {
        let mut cfg = Config::default();
        cfg.prompt_defaults
            .insert("debugger".into(), PromptRule::default());
        cfg.prompt_defaults.insert(
            "mine".into(),
            PromptRule {
                prompt_path: Some("custom-mine.md".into()),
                ..PromptRule::default()
            },
        );
        let dir = tempfile::tempdir().unwrap();

        let err =
            build_delete_prompt_plan(&cfg, PlanScope::Global, "debugger", dir.path()).unwrap_err();
        assert_eq!(err, PlanError::BuiltinImmutable("debugger".into()));

        let plan =
            build_delete_prompt_plan(&cfg, PlanScope::Global, "mine", dir.path()).unwrap();
        assert_eq!(plan.file_op.kind, FileOpKind::Delete);
        assert!(!plan.next_config.prompt_defaults.contains_key("mine"));
    }

    #[test]
    fn repo_scope_uses_repo_slug_in_file_name() {
        let mut cfg = Config::default();
        cfg.repositories.push(cyrus_config::Repository {
            id: "My Repo".into(),
            name: "My Repo".into(),
            repository_path: "/srv/r".into(),
            linear_workspace_id: "ws".into(),
            linear_token: "t".into(),
            ..cyrus_config::Repository::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let plan = build_create_prompt_plan(
            &cfg,
            PlanScope::Repository("My Repo".into()),
            "helper",
            &[],
            "body",
            dir.path(),
        )
        .unwrap();
        assert_eq!(
            plan.prompt_path.as_deref(),
            Some("custom-helper-my-repo.md")
        );
    }

    #[test]
    fn plan_applied_then_replanned_yields_clean_edit() {
        // Apply a create plan's file operation and config, then re-plan an
        // edit on the result: no warnings, no conflicts, no name surprises.
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let create = build_create_prompt_plan(
            &cfg,
            PlanScope::Global,
            "reviewer",
            &labels(&["review"]),
            "Review the change.",
            dir.path(),
        )
        .unwrap();

        std::fs::write(
            create.file_op.path.as_ref().unwrap(),
            create.file_op.next_content.as_ref().unwrap(),
        )
        .unwrap();

        let edit = build_edit_prompt_plan(
            &create.next_config,
            PlanScope::Global,
            "reviewer",
            None,
            Some("Review the change thoroughly."),
            dir.path(),
        )
        .unwrap();
        assert_eq!(edit.action, PlanAction::Edit);
        assert!(edit.warnings.is_empty());
        assert!(edit.conflicts.is_empty());
        assert_eq!(edit.file_op.kind, FileOpKind::Update);
        assert_eq!(
            edit.file_op.previous_content.as_deref(),
            Some("Review the change.")
        );
    }
}
