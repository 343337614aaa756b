// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod plan;
mod templates;

pub use plan::{
    build_create_prompt_plan, build_delete_prompt_plan, build_edit_prompt_plan, normalize_name,
    FileOp, FileOpKind, LabelConflict, PlanAction, PlanError, PlanScope, PromptPlan,
};
pub use templates::{
    builtin_names, is_builtin_name, load_system_prompt, render_issue_prompt, wrap_new_comment,
    IssueContext,
};
