// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Exit codes: 0 success, 1 user error, 2 system error.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_USER_ERROR: i32 = 1;
pub const EXIT_SYSTEM_ERROR: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "cyrus",
    about = "Edge worker bridging issue trackers and chat surfaces to AI coding agents",
    version
)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file override (default: $CYRUS_HOME/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the edge worker: HTTP listener, transports, sessions.
    Start {
        /// Listen address for the shared application server
        #[arg(long, default_value = "0.0.0.0:3456", env = "CYRUS_BIND")]
        bind: std::net::SocketAddr,
        /// Coding agent to run sessions with (claude | codex | gemini)
        #[arg(long, default_value = "claude", env = "CYRUS_RUNNER")]
        runner: String,
        /// Executable for the agent CLI (defaults to the runner name)
        #[arg(long, env = "CYRUS_RUNNER_CMD")]
        runner_cmd: Option<String>,
        /// Model override forwarded to the runner
        #[arg(long, env = "CYRUS_MODEL")]
        model: Option<String>,
    },

    /// Authorize cyrus with the issue tracker via OAuth.
    Auth {
        /// Listen address for the local callback receiver
        #[arg(long, default_value = "127.0.0.1:3456")]
        bind: std::net::SocketAddr,
    },

    /// Record the billing customer id in the config.
    SetCustomerId { customer_id: String },

    /// Verify every configured repository token against the tracker API.
    CheckTokens,

    /// Manage label→prompt rules and their prompt files.
    Prompts {
        #[command(subcommand)]
        command: PromptsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PromptsCommand {
    /// Create a custom prompt and claim labels for it.
    Create {
        name: String,
        /// Labels that route to this prompt (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
        /// File with the prompt body; read from stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
        /// Scope the prompt to one repository id instead of globally
        #[arg(long)]
        repository: Option<String>,
    },
    /// Edit an existing prompt's labels and/or body.
    Edit {
        name: String,
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        repository: Option<String>,
    },
    /// Delete a custom prompt and its file.
    Delete {
        name: String,
        #[arg(long)]
        repository: Option<String>,
    },
}

// ── Unit tests ────────────────────────────────────────────────────────────────
