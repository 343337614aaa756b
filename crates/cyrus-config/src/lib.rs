// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod env;
mod manager;
mod schema;
mod store;

pub use env::{mask_secret, CyrusEnv};
pub use manager::{ConfigDiff, ConfigEvent, ConfigManager};
pub use schema::{
    Config, ConfigError, PromptRule, Repository, ToolPolicy, ToolPreset, WorkerSettings,
};
pub use store::ConfigStore;
