// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prompt-type hooks around tool use.
//!
//! A hook set is selected by the routed prompt's name. Hooks observe the
//! canonical stream on the session pump and may inject guidance back into a
//! streaming session. The orchestrator role uses this to police todo-list
//! hygiene around `TodoWrite`/`Task` calls.

use serde_json::Value;

/// What a pre-tool hook wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolHookDecision {
    /// Proceed untouched.
    Continue,
    /// Proceed, and inject this guidance into the session's stream input.
    Inject(String),
}

/// Callbacks selected per prompt type.
pub trait PromptHooks: Send + Sync {
    /// Called when the runner announces a tool call.
    fn pre_tool_use(&self, _tool: &str, _input: &Value) -> ToolHookDecision {
        ToolHookDecision::Continue
    }

    /// Called when the paired tool result arrives.
    fn post_tool_use(&self, _tool: &str, _input: &Value, _is_error: bool) -> ToolHookDecision {
        ToolHookDecision::Continue
    }
}

/// No-op hooks for ordinary prompt types.
pub struct NoHooks;

impl PromptHooks for NoHooks {}

/// The orchestrator role's guidance around todo-list traffic.
pub struct OrchestratorHooks;

impl PromptHooks for OrchestratorHooks {
    fn pre_tool_use(&self, tool: &str, input: &Value) -> ToolHookDecision {
        if tool != "TodoWrite" {
            return ToolHookDecision::Continue;
        }
        let empty = input
            .get("todos")
            .and_then(|t| t.as_array())
            .map(|t| t.is_empty())
            .unwrap_or(true);
        if empty {
            ToolHookDecision::Inject(
                "Keep the todo list populated while coordinating: every delegated \
                 sub-task needs an entry with an owner and a status."
                    .to_string(),
            )
        } else {
            ToolHookDecision::Continue
        }
    }

    fn post_tool_use(&self, tool: &str, _input: &Value, is_error: bool) -> ToolHookDecision {
        if tool == "Task" && is_error {
            ToolHookDecision::Inject(
                "A delegated task failed. Update the todo list to reflect the failure \
                 before delegating further work."
                    .to_string(),
            )
        } else {
            ToolHookDecision::Continue
        }
    }
}

/// Hook set for a routed prompt name.
pub fn hooks_for_prompt(prompt_name: &str) -> Box<dyn PromptHooks> {
    match prompt_name {
        "orchestrator" => Box::new(OrchestratorHooks),
        _ => Box::new(NoHooks),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
