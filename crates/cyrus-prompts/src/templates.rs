// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Built-in system prompts and user-prompt rendering.
//!
//! A prompt rule without a `prompt_path` names one of the built-in templates
//! below. Rules with a path load their prompt from disk: absolute paths and
//! `~`-prefixed paths are used as-is, anything else resolves relative to the
//! prompts directory.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

use cyrus_config::PromptRule;

const DEBUGGER_PROMPT: &str = "\
You are a debugging specialist working inside a checked-out repository.

Reproduce the reported failure before changing anything. Prefer adding a
failing test over reasoning from the description alone. Keep fixes minimal:
address the defect, not the surrounding style. When the root cause is in a
dependency or the environment, say so instead of patching around it.

Report what you found, what you changed, and how you verified the fix.";

const BUILDER_PROMPT: &str = "\
You are implementing a feature described in the issue below.

Read the neighbouring code first and follow its conventions. Build in small
verifiable steps and run the project's tests as you go. If the issue is
ambiguous, pick the interpretation that matches existing behaviour and note
the decision in your summary.

Finish with a summary of the changes and anything intentionally left out.";

const SCOPER_PROMPT: &str = "\
You are scoping the issue below — do not write implementation code.

Explore the codebase, identify the files and subsystems involved, and
produce a concrete plan: ordered steps, risks, and an estimate of the blast
radius. Call out open questions that need a human decision.";

const ORCHESTRATOR_PROMPT: &str = "\
You are coordinating a multi-step task. Maintain a todo list, delegate
implementation detail to sub-tasks, and keep every list entry's status
current. Never let work proceed that is not reflected in the list.";

/// Name → embedded template. Order matters only for display.
const BUILTINS: &[(&str, &str)] = &[
    ("debugger", DEBUGGER_PROMPT),
    ("builder", BUILDER_PROMPT),
    ("scoper", SCOPER_PROMPT),
    ("orchestrator", ORCHESTRATOR_PROMPT),
];

pub fn builtin_names() -> Vec<&'static str> {
    BUILTINS.iter().map(|(n, _)| *n).collect()
}

pub fn is_builtin_name(name: &str) -> bool {
    BUILTINS.iter().any(|(n, _)| *n == name)
}

/// Resolve the system prompt for `rule`.
///
/// Built-in rules (no `prompt_path`) return the embedded template registered
/// under `name`; unknown names fall back to the builder template.
pub fn load_system_prompt(
    name: &str,
    rule: &PromptRule,
    prompts_dir: &Path,
) -> anyhow::Result<String> {
    match &rule.prompt_path {
        None => Ok(BUILTINS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, body)| (*body).to_string())
            .unwrap_or_else(|| BUILDER_PROMPT.to_string())),
        Some(raw) => {
            let expanded = shellexpand::tilde(raw).into_owned();
            let path = Path::new(&expanded);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                prompts_dir.join(path)
            };
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading prompt file {}", path.display()))
        }
    }
}

/// The issue fields rendered into the user prompt.
#[derive(Debug, Clone, Default)]
pub struct IssueContext {
    pub issue_id: String,
    pub issue_key: String,
    pub title: String,
    pub description: String,
    /// The triggering comment, if the session started from one.
    pub comment: Option<String>,
    pub author: Option<String>,
}

/// Render the first user prompt of a session.
///
/// The issue is wrapped in a `<linear_issue>` tag so the agent can reliably
/// separate tracker content from human commentary.
pub fn render_issue_prompt(ctx: &IssueContext) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "<linear_issue id=\"{}\" identifier=\"{}\">\n",
        ctx.issue_id, ctx.issue_key
    ));
    out.push_str(&format!("# {}\n", ctx.title));
    if !ctx.description.is_empty() {
        out.push('\n');
        out.push_str(&ctx.description);
        out.push('\n');
    }
    out.push_str("</linear_issue>\n");
    if let Some(comment) = &ctx.comment {
        out.push('\n');
        match &ctx.author {
            Some(author) => out.push_str(&format!("User comment: ({author}) {comment}\n")),
            None => out.push_str(&format!("User comment: {comment}\n")),
        }
    }
    out
}

/// Wrap a follow-up comment for injection into a live streaming session.
///
/// Bursts of comments are merged by concatenating these blocks, preserving
/// per-comment attribution.
pub fn wrap_new_comment(author: &str, timestamp: DateTime<Utc>, content: &str) -> String {
    format!(
        "<new_comment><author>{}</author><timestamp>{}</timestamp><content>{}</content></new_comment>",
        author,
        timestamp.to_rfc3339(),
        content
    )
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_by_name() {
        let rule = PromptRule::default();
        let prompt = load_system_prompt("debugger", &rule, Path::new("/nowhere")).unwrap();
        assert!(prompt.contains("debugging specialist"));
    }

    #[test]
    fn unknown_builtin_falls_back_to_builder() {
        let rule = PromptRule::default();
        let prompt = load_system_prompt("no-such", &rule, Path::new("/nowhere")).unwrap();
        assert!(prompt.contains("implementing a feature"));
    }

    #[test]
    fn custom_path_resolves_relative_to_prompts_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom-x.md"), "custom body").unwrap();
        let rule = PromptRule {
            prompt_path: Some("custom-x.md".into()),
            ..PromptRule::default()
        };
        let prompt = load_system_prompt("x", &rule, dir.path()).unwrap();
        assert_eq!(prompt, "custom body");
    }

    #[test]
    fn missing_custom_file_is_an_error() {
        let rule = PromptRule {
            prompt_path: Some("/does/not/exist.md".into()),
            ..PromptRule::default()
        };
        assert!(load_system_prompt("x", &rule, Path::new("/tmp")).is_err());
    }

    #[test]
    fn issue_prompt_wraps_issue_and_comment() {
        let ctx = IssueContext {
            issue_id: "iss-1".into(),
            issue_key: "ENG-42".into(),
            title: "Crash on save".into(),
            description: "Steps to reproduce…".into(),
            comment: Some("please look into this".into()),
            author: Some("alice".into()),
        };
        let prompt = render_issue_prompt(&ctx);
        assert!(prompt.contains("<linear_issue id=\"iss-1\" identifier=\"ENG-42\">"));
        assert!(prompt.contains("# Crash on save"));
        assert!(prompt.contains("User comment: (alice) please look into this"));
        assert!(prompt.ends_with('\n'));
    }

    #[test]
    fn new_comment_wrapper_carries_attribution() {
        let ts = Utc::now();
        let wrapped = wrap_new_comment("bob", ts, "try again?");
        assert!(wrapped.starts_with("<new_comment><author>bob</author>"));
        assert!(wrapped.contains(&ts.to_rfc3339()));
        assert!(wrapped.ends_with("<content>try again?</content></new_comment>"));
    }
}
