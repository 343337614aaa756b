// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, PromptsCommand, EXIT_SUCCESS, EXIT_SYSTEM_ERROR, EXIT_USER_ERROR};
use cyrus_config::{mask_secret, ConfigManager, ConfigStore, CyrusEnv};
use cyrus_edge::{EdgeWorker, EdgeWorkerOptions, RunnerRequest, WorkspaceManager};
use cyrus_prompts::{
    build_create_prompt_plan, build_delete_prompt_plan, build_edit_prompt_plan, FileOpKind,
    PlanError, PlanScope, PromptPlan,
};
use cyrus_runner::{AgentRunner, ProcessRunner, RunnerConfig, RunnerKind};
use cyrus_server::{AdminState, OauthBroker, SharedServer};
use cyrus_tracker::{ActivitySink, HttpTracker, IssueTracker, TrackerSink};
use cyrus_transport::{
    ChatMentionTransport, CodeHostTransport, EventTransport, TrackerWebhookTransport, VerifyMode,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            // Prompt-plan violations are operator mistakes, not system faults.
            if e.downcast_ref::<PlanError>().is_some() {
                EXIT_USER_ERROR
            } else {
                EXIT_SYSTEM_ERROR
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let env = Arc::new(CyrusEnv::load());
    let config_path = cli.config.clone().unwrap_or_else(|| env.config_path());

    match cli.command {
        Commands::Start {
            bind,
            runner,
            runner_cmd,
            model,
        } => run_start(env, config_path, bind, &runner, runner_cmd, model).await,
        Commands::Auth { bind } => run_auth(bind).await,
        Commands::SetCustomerId { customer_id } => {
            let manager = open_config(config_path)?;
            manager.update(serde_json::json!({ "stripeCustomerId": customer_id }))?;
            println!("Customer id saved.");
            Ok(())
        }
        Commands::CheckTokens => run_check_tokens(config_path).await,
        Commands::Prompts { command } => run_prompts(&env, config_path, command),
    }
}

/// Backups kept next to the config file; mirrors the worker-settings
/// default so CLI saves and worker saves prune identically.
const BACKUP_RETENTION: usize = 10;

fn open_config(path: std::path::PathBuf) -> anyhow::Result<Arc<ConfigManager>> {
    let store = ConfigStore::new(path, BACKUP_RETENTION);
    Ok(Arc::new(ConfigManager::new(store)?))
}

// ── start ─────────────────────────────────────────────────────────────────────

async fn run_start(
    env: Arc<CyrusEnv>,
    config_path: std::path::PathBuf,
    bind: std::net::SocketAddr,
    runner: &str,
    runner_cmd: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let runner_kind: RunnerKind = runner.parse()?;
    let manager = open_config(config_path)?;
    let settings = manager.get().worker.clone();
    manager.start_watching()?;

    // ── Transports ────────────────────────────────────────────────────────────
    // Behind the proxy the upstream signature is already verified and a
    // shared Bearer secret authenticates the forwarded request; direct
    // deliveries carry the HMAC signature themselves.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let webhook_secret = std::env::var("CYRUS_WEBHOOK_SECRET").unwrap_or_default();
    let tracker_mode = if env.proxy_url.is_some() {
        VerifyMode::bearer(webhook_secret.clone())
    } else {
        VerifyMode::hmac(webhook_secret.as_bytes())
    };
    let mut transports: Vec<Box<dyn EventTransport>> = vec![Box::new(
        TrackerWebhookTransport::new(tracker_mode, event_tx.clone()),
    )];
    if let Ok(secret) = std::env::var("SLACK_SIGNING_SECRET") {
        transports.push(Box::new(ChatMentionTransport::new(
            VerifyMode::hmac(secret.as_bytes()),
            event_tx.clone(),
        )));
    }
    if let Ok(secret) = std::env::var("GITHUB_WEBHOOK_SECRET") {
        transports.push(Box::new(CodeHostTransport::new(
            VerifyMode::hmac(secret.as_bytes()),
            event_tx.clone(),
        )));
    }
    drop(event_tx);

    // ── Worker ────────────────────────────────────────────────────────────────
    let log_root = env.logs_dir();
    let runner_command = runner_cmd.unwrap_or_else(|| runner_kind.as_str().to_string());
    let model = model.unwrap_or_default();
    let idle_timeout = settings.idle_timeout_secs;
    let runner_factory = {
        let runner_command = runner_command.clone();
        Arc::new(move |request: &RunnerRequest| {
            let mut config = RunnerConfig::new(request.kind, &runner_command, &request.workspace);
            config.model = model.clone();
            config.allowed_tools = request.allowed_tools.clone();
            config.system_prompt = request.system_prompt.clone();
            config.log_dir = request.log_dir.clone();
            config.idle_timeout_secs = idle_timeout;
            if let Some(prompt) = &request.system_prompt {
                config.args.push("--append-system-prompt".to_string());
                config.args.push(prompt.clone());
            }
            if !request.allowed_tools.is_empty() {
                config.args.push("--allowed-tools".to_string());
                config.args.push(request.allowed_tools.join(","));
            }
            if !config.model.is_empty() {
                config.args.push("--model".to_string());
                config.args.push(config.model.clone());
            }
            Arc::new(ProcessRunner::new(config)) as Arc<dyn AgentRunner>
        })
    };

    let sink_factory = {
        let manager = manager.clone();
        Arc::new(
            move |key: &cyrus_protocol::SessionKey,
                  _event: &cyrus_protocol::InboundEvent|
                  -> futures::future::BoxFuture<
                'static,
                anyhow::Result<Arc<dyn ActivitySink>>,
            > {
                let token = manager
                    .get()
                    .repository(&key.repository_id)
                    .map(|r| r.linear_token.clone());
                let issue_id = key.issue_id.clone();
                Box::pin(async move {
                    let token = token.context("repository disappeared from config")?;
                    let tracker: Arc<dyn IssueTracker> = Arc::new(HttpTracker::new(token));
                    let agent_session = tracker.create_agent_session(&issue_id).await?;
                    Ok(Arc::new(TrackerSink::new(tracker, agent_session))
                        as Arc<dyn ActivitySink>)
                })
            },
        )
    };

    let default_tracker: Option<Arc<dyn IssueTracker>> = env
        .linear_api_token
        .as_ref()
        .map(|token| Arc::new(HttpTracker::new(token.clone())) as Arc<dyn IssueTracker>);

    let worker = EdgeWorker::new(EdgeWorkerOptions {
        config: manager.clone(),
        runner_factory,
        sink_factory,
        runner_kind,
        workspaces: WorkspaceManager::new(settings.use_worktrees),
        prompts_dir: env.prompts_dir(),
        log_dir: log_root,
        tracker: default_tracker,
    });

    // ── Shared server ─────────────────────────────────────────────────────────
    let oauth = OauthBroker::new();
    let admin = std::env::var("CYRUS_ADMIN_TOKEN").ok().map(|token| {
        let registry = worker.registry();
        AdminState::new(
            manager.clone(),
            env.clone(),
            token,
            Arc::new(move || registry.snapshots()),
        )
    });
    let server = SharedServer::new(&transports, oauth, admin);
    let handle = server.bind(bind).await?;

    let worker_task = tokio::spawn(worker.clone().run(event_rx));

    // Run until interrupted, then drain: stop accepting events, flush
    // sessions within the grace budget, close the listener.
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;
    worker
        .drain(std::time::Duration::from_secs(settings.shutdown_grace_secs))
        .await;
    worker_task.abort();
    Ok(())
}

// ── auth ──────────────────────────────────────────────────────────────────────

async fn run_auth(bind: std::net::SocketAddr) -> anyhow::Result<()> {
    let oauth = OauthBroker::new();
    let transports: Vec<Box<dyn EventTransport>> = Vec::new();
    let server = SharedServer::new(&transports, oauth.clone(), None);
    let handle = server.bind(bind).await?;

    let (state, code_fut) = oauth.begin();
    let redirect = format!("http://{}/callback", handle.local_addr);
    let url = format!(
        "https://linear.app/oauth/authorize?response_type=code&state={state}&redirect_uri={redirect}&scope=read,write,app:assignable,app:mentionable"
    );
    println!("Open this URL in your browser to authorize cyrus:\n\n  {url}\n");
    println!("Waiting for the authorization to complete (5 minute timeout)…");

    let result = code_fut.await;
    handle.shutdown().await;
    let code = result.context("authorization did not complete")?;
    println!("Authorization code received: {}", mask_secret(&code));
    println!("Exchange it for an API token in the tracker's app settings, then run:");
    println!("  cyrus check-tokens");
    Ok(())
}

// ── check-tokens ──────────────────────────────────────────────────────────────

async fn run_check_tokens(config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let manager = open_config(config_path)?;
    let config = manager.get();
    if config.repositories.is_empty() {
        println!("No repositories configured.");
        return Ok(());
    }

    let mut failures = 0usize;
    for repo in &config.repositories {
        let tracker = HttpTracker::new(repo.linear_token.clone());
        match tracker.verify_token().await {
            Ok(name) => {
                println!(
                    "{:<20} {:<12} OK ({name})",
                    repo.id,
                    mask_secret(&repo.linear_token)
                );
            }
            Err(e) => {
                failures += 1;
                println!(
                    "{:<20} {:<12} FAILED: {e}",
                    repo.id,
                    mask_secret(&repo.linear_token)
                );
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} repository token(s) failed verification");
    }
    Ok(())
}

// ── prompts ───────────────────────────────────────────────────────────────────

fn run_prompts(
    env: &CyrusEnv,
    config_path: std::path::PathBuf,
    command: PromptsCommand,
) -> anyhow::Result<()> {
    let manager = open_config(config_path)?;
    let config = manager.get();
    let prompts_dir = env.prompts_dir();
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("creating {}", prompts_dir.display()))?;

    let plan = match command {
        PromptsCommand::Create {
            name,
            labels,
            file,
            repository,
        } => {
            let content = read_prompt_body(file)?;
            build_create_prompt_plan(
                &config,
                scope_for(repository),
                &name,
                &labels,
                &content,
                &prompts_dir,
            )?
        }
        PromptsCommand::Edit {
            name,
            labels,
            file,
            repository,
        } => {
            let content = file.map(std::fs::read_to_string).transpose()?;
            let labels = (!labels.is_empty()).then_some(labels);
            build_edit_prompt_plan(
                &config,
                scope_for(repository),
                &name,
                labels.as_deref(),
                content.as_deref(),
                &prompts_dir,
            )?
        }
        PromptsCommand::Delete { name, repository } => {
            build_delete_prompt_plan(&config, scope_for(repository), &name, &prompts_dir)?
        }
    };

    apply_plan(&manager, plan)
}

fn scope_for(repository: Option<String>) -> PlanScope {
    match repository {
        Some(id) => PlanScope::Repository(id),
        None => PlanScope::Global,
    }
}

fn read_prompt_body(file: Option<std::path::PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => {
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("reading prompt body from stdin")?;
            Ok(body)
        }
    }
}

fn apply_plan(manager: &ConfigManager, plan: PromptPlan) -> anyhow::Result<()> {
    for warning in &plan.warnings {
        println!("warning: {warning}");
    }
    for conflict in &plan.conflicts {
        println!(
            "note: label {:?} is also claimed by prompt {:?}",
            conflict.label, conflict.claimed_by
        );
    }

    match plan.file_op.kind {
        FileOpKind::Create | FileOpKind::Update => {
            let path = plan.file_op.path.as_ref().expect("file op carries a path");
            std::fs::write(path, plan.file_op.next_content.as_deref().unwrap_or(""))
                .with_context(|| format!("writing {}", path.display()))?;
        }
        FileOpKind::Delete => {
            let path = plan.file_op.path.as_ref().expect("file op carries a path");
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("deleting {}", path.display()));
                }
            }
        }
        FileOpKind::None => {}
    }

    manager.replace(plan.next_config)?;
    println!("Prompt {:?} {:?} applied.", plan.prompt_name, plan.action);
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn,cyrus=info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
