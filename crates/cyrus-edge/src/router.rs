// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Event routing: from a normalised inbound event to a dispatch intent.
//!
//! Routing is pure — it reads the config snapshot and a live-session lookup
//! and returns what should happen; the worker performs it. Repository
//! resolution failures are deliberate route errors, never guesses: two
//! repositories claiming the same team key or channel is fatal for that
//! event.

use cyrus_config::{Config, PromptRule, Repository, ToolPolicy, ToolPreset};
use cyrus_protocol::{EventKind, InboundEvent, SessionKey, TransportKind};

/// Tool lists the presets expand to.
const READ_ONLY_TOOLS: &[&str] = &["Read", "Grep", "Glob", "WebFetch"];
const SAFE_TOOLS: &[&str] = &["Read", "Grep", "Glob", "WebFetch", "Edit", "Write", "TodoWrite"];
const ALL_TOOLS: &[&str] = &[
    "Read", "Grep", "Glob", "WebFetch", "Edit", "Write", "TodoWrite", "Bash", "Task",
];
const COORDINATOR_TOOLS: &[&str] = &["Read", "Grep", "Glob", "TodoWrite", "Task"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no repository matches the event ({0})")]
    NoRepository(String),
    #[error("ambiguous repository routing: {0:?} all match")]
    AmbiguousRepository(Vec<String>),
}

/// The selected prompt rule and how it was chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptChoice {
    pub name: String,
    pub rule: PromptRule,
    /// `label-based`, `global-default`, or `fallback`.
    pub prompt_type: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteMetadata {
    pub warnings: Vec<String>,
}

/// What the worker should do with one event.
#[derive(Debug)]
pub enum DispatchIntent {
    CreateSession {
        key: SessionKey,
        event: InboundEvent,
        prompt: PromptChoice,
        tools: Vec<String>,
        metadata: RouteMetadata,
    },
    PromptExisting {
        key: SessionKey,
        event: InboundEvent,
    },
    StopSession {
        key: SessionKey,
        event: InboundEvent,
    },
    Ignore {
        reason: String,
    },
}

/// Resolve the repository for an event.
///
/// Matching, in order of evidence: tracker team key, then chat channel
/// binding. A single configured active repository also catches events that
/// carry no routing evidence at all. More than one match is fatal.
fn resolve_repository<'a>(
    config: &'a Config,
    event: &InboundEvent,
) -> Result<&'a Repository, RouteError> {
    let active: Vec<&Repository> = config
        .repositories
        .iter()
        .filter(|r| r.is_active)
        .collect();

    let team_key = event.issue.as_ref().and_then(|i| i.team_key.as_deref());
    let channel = event.surface.channel_id.as_deref();

    let matches: Vec<&Repository> = active
        .iter()
        .copied()
        .filter(|repo| {
            let by_team = team_key
                .map(|k| repo.team_keys.iter().any(|t| t.eq_ignore_ascii_case(k)))
                .unwrap_or(false);
            let by_channel = channel
                .map(|c| repo.channel_bindings.iter().any(|b| b == c))
                .unwrap_or(false);
            by_team || by_channel
        })
        .collect();

    match matches.len() {
        1 => Ok(matches[0]),
        0 if active.len() == 1 => Ok(active[0]),
        0 => Err(RouteError::NoRepository(format!(
            "team={team_key:?} channel={channel:?}"
        ))),
        _ => Err(RouteError::AmbiguousRepository(
            matches.iter().map(|r| r.id.clone()).collect(),
        )),
    }
}

/// Choose the prompt for an event's labels.
///
/// Repository-scoped rules win over the global defaults; within a scope the
/// rule with the fewest labels wins (most specific), then lexical name
/// order. Labels claimed by more than one rule are surfaced as warnings.
fn resolve_prompt(
    config: &Config,
    repo: &Repository,
    labels: &[String],
    warnings: &mut Vec<String>,
) -> PromptChoice {
    for (scope_rules, prompt_type) in [
        (&repo.label_prompts, "label-based"),
        (&config.prompt_defaults, "global-default"),
    ] {
        let mut matched: Vec<(&String, &PromptRule)> = scope_rules
            .iter()
            .filter(|(_, rule)| labels.iter().any(|l| rule.matches_label(l)))
            .collect();
        if matched.is_empty() {
            continue;
        }

        // Conflicts: a label claimed by several rules in this scope.
        for label in labels {
            let claimants: Vec<&str> = matched
                .iter()
                .filter(|(_, rule)| rule.matches_label(label))
                .map(|(name, _)| name.as_str())
                .collect();
            if claimants.len() > 1 {
                warnings.push(format!(
                    "label {label:?} is claimed by prompts {claimants:?}; most specific wins"
                ));
            }
        }

        matched.sort_by(|a, b| {
            a.1.labels
                .len()
                .cmp(&b.1.labels.len())
                .then_with(|| a.0.cmp(b.0))
        });
        let (name, rule) = matched[0];
        return PromptChoice {
            name: name.clone(),
            rule: rule.clone(),
            prompt_type,
        };
    }

    PromptChoice {
        name: "fallback".to_string(),
        rule: PromptRule::default(),
        prompt_type: "fallback",
    }
}

fn expand_policy(policy: &ToolPolicy) -> Vec<String> {
    match policy {
        ToolPolicy::Preset(preset) => {
            let list = match preset {
                ToolPreset::ReadOnly => READ_ONLY_TOOLS,
                ToolPreset::Safe => SAFE_TOOLS,
                ToolPreset::All => ALL_TOOLS,
                ToolPreset::Coordinator => COORDINATOR_TOOLS,
            };
            list.iter().map(|s| s.to_string()).collect()
        }
        ToolPolicy::Explicit(tools) => tools.clone(),
    }
}

/// Resolve the effective tool list for a session.
///
/// The rule's policy (or the repository default) is expanded; when both
/// exist the rule's expansion is intersected with the repository default;
/// disallowed tools from both levels are subtracted.
pub fn resolve_tools(rule: &PromptRule, repo: &Repository) -> Vec<String> {
    let repo_default = repo.allowed_tools.as_ref().map(expand_policy);
    let mut tools = match (&rule.allowed_tools, &repo_default) {
        (Some(policy), Some(default)) => {
            let expanded = expand_policy(policy);
            expanded
                .into_iter()
                .filter(|t| default.contains(t))
                .collect()
        }
        (Some(policy), None) => expand_policy(policy),
        (None, Some(default)) => default.clone(),
        (None, None) => SAFE_TOOLS.iter().map(|s| s.to_string()).collect(),
    };
    tools.retain(|t| {
        !rule.disallowed_tools.iter().any(|d| d == t)
            && !repo.disallowed_tools.iter().any(|d| d == t)
    });
    tools.dedup();
    tools
}

/// Classify one inbound event against the config and live-session state.
pub fn route_event(
    config: &Config,
    event: InboundEvent,
    find_live: impl Fn(&str, &InboundEvent) -> Option<SessionKey>,
) -> Result<DispatchIntent, RouteError> {
    if event.kind == EventKind::Ignore {
        return Ok(DispatchIntent::Ignore {
            reason: "event kind carries no action".to_string(),
        });
    }

    let repo = resolve_repository(config, &event)?;
    let live = find_live(&repo.id, &event);

    match event.kind {
        EventKind::Unassign | EventKind::Stop => match live {
            Some(key) => Ok(DispatchIntent::StopSession { key, event }),
            None => Ok(DispatchIntent::Ignore {
                reason: "stop for an issue with no live session".to_string(),
            }),
        },
        EventKind::NewThread | EventKind::Mention | EventKind::Reply => {
            if let Some(key) = live {
                return Ok(DispatchIntent::PromptExisting { key, event });
            }
            let Some(issue) = event.issue.clone() else {
                return Ok(DispatchIntent::Ignore {
                    reason: "no issue reference to create a session from".to_string(),
                });
            };

            let mut warnings = Vec::new();
            let prompt = resolve_prompt(config, repo, &issue.labels, &mut warnings);
            let tools = resolve_tools(&prompt.rule, repo);

            let mut key = SessionKey::new(&repo.id, &issue.issue_id);
            if event.transport == TransportKind::Chat {
                if let Some(thread) = &event.surface.thread_id {
                    key = key.with_thread(thread.clone());
                }
            }

            Ok(DispatchIntent::CreateSession {
                key,
                event,
                prompt,
                tools,
                metadata: RouteMetadata { warnings },
            })
        }
        EventKind::Ignore => unreachable!("handled above"),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cyrus_protocol::{IssueRefs, SurfaceRefs};

    fn repo(id: &str) -> Repository {
        Repository {
            id: id.into(),
            name: id.into(),
            repository_path: format!("/srv/{id}"),
            linear_workspace_id: "ws".into(),
            linear_token: "tok".into(),
            team_keys: vec!["ENG".into()],
            ..Repository::default()
        }
    }

    fn assign_event(labels: &[&str]) -> InboundEvent {
        InboundEvent {
            transport: TransportKind::Tracker,
            envelope_id: "e1".into(),
            kind: EventKind::NewThread,
            author: "alice".into(),
            content: "please fix".into(),
            attachments: vec![],
            surface: SurfaceRefs::default(),
            occurred_at: Utc::now(),
            issue: Some(IssueRefs {
                issue_id: "iss-1".into(),
                issue_key: "ENG-1".into(),
                team_key: Some("ENG".into()),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    fn no_live(_: &str, _: &InboundEvent) -> Option<SessionKey> {
        None
    }

    #[test]
    fn assignment_with_no_label_rules_uses_fallback_prompt() {
        let config = Config {
            repositories: vec![repo("r1")],
            ..Config::default()
        };
        let intent = route_event(&config, assign_event(&[]), no_live).unwrap();
        match intent {
            DispatchIntent::CreateSession { key, prompt, tools, .. } => {
                assert_eq!(key, SessionKey::new("r1", "iss-1"));
                assert_eq!(prompt.prompt_type, "fallback");
                assert!(tools.contains(&"Read".to_string()), "default tool set");
            }
            other => panic!("expected CreateSession, got {other:?}"),
        }
    }

    #[test]
    fn label_routes_to_repo_scoped_prompt() {
        let mut r = repo("r1");
        r.label_prompts.insert(
            "builder".into(),
            PromptRule {
                labels: vec!["feature".into()],
                prompt_path: Some("custom-builder.md".into()),
                ..PromptRule::default()
            },
        );
        let config = Config {
            repositories: vec![r],
            ..Config::default()
        };
        let intent = route_event(&config, assign_event(&["Feature"]), no_live).unwrap();
        match intent {
            DispatchIntent::CreateSession { prompt, metadata, .. } => {
                assert_eq!(prompt.name, "builder");
                assert_eq!(prompt.prompt_type, "label-based");
                assert!(metadata.warnings.is_empty());
            }
            other => panic!("expected CreateSession, got {other:?}"),
        }
    }

    #[test]
    fn fewest_labels_wins_then_lexical() {
        let mut r = repo("r1");
        r.label_prompts.insert(
            "broad".into(),
            PromptRule {
                labels: vec!["feature".into(), "bug".into(), "chore".into()],
                ..PromptRule::default()
            },
        );
        r.label_prompts.insert(
            "narrow".into(),
            PromptRule {
                labels: vec!["feature".into()],
                ..PromptRule::default()
            },
        );
        let config = Config {
            repositories: vec![r],
            ..Config::default()
        };
        let intent = route_event(&config, assign_event(&["feature"]), no_live).unwrap();
        match intent {
            DispatchIntent::CreateSession { prompt, metadata, .. } => {
                assert_eq!(prompt.name, "narrow", "more specific rule wins");
                assert_eq!(metadata.warnings.len(), 1, "conflict surfaced");
            }
            other => panic!("expected CreateSession, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_team_key_is_fatal() {
        let config = Config {
            repositories: vec![repo("r1"), repo("r2")],
            ..Config::default()
        };
        let err = route_event(&config, assign_event(&[]), no_live).unwrap_err();
        assert!(matches!(err, RouteError::AmbiguousRepository(ids) if ids.len() == 2));
    }

    #[test]
    fn no_match_with_multiple_repos_is_route_error() {
        let mut r2 = repo("r2");
        r2.team_keys = vec!["OPS".into()];
        let mut r1 = repo("r1");
        r1.team_keys = vec!["WEB".into()];
        let config = Config {
            repositories: vec![r1, r2],
            ..Config::default()
        };
        let err = route_event(&config, assign_event(&[]), no_live).unwrap_err();
        assert!(matches!(err, RouteError::NoRepository(_)));
    }

    #[test]
    fn single_repo_catches_evidence_free_events() {
        let mut r = repo("r1");
        r.team_keys.clear();
        let config = Config {
            repositories: vec![r],
            ..Config::default()
        };
        let mut ev = assign_event(&[]);
        ev.issue.as_mut().unwrap().team_key = None;
        assert!(matches!(
            route_event(&config, ev, no_live).unwrap(),
            DispatchIntent::CreateSession { .. }
        ));
    }

    #[test]
    fn reply_with_live_session_prompts_it() {
        let config = Config {
            repositories: vec![repo("r1")],
            ..Config::default()
        };
        let mut ev = assign_event(&[]);
        ev.kind = EventKind::Reply;
        let live_key = SessionKey::new("r1", "iss-1");
        let lk = live_key.clone();
        let intent = route_event(&config, ev, move |_, _| Some(lk.clone())).unwrap();
        assert!(matches!(
            intent,
            DispatchIntent::PromptExisting { key, .. } if key == live_key
        ));
    }

    #[test]
    fn reply_without_live_session_creates_one() {
        let config = Config {
            repositories: vec![repo("r1")],
            ..Config::default()
        };
        let mut ev = assign_event(&[]);
        ev.kind = EventKind::Reply;
        assert!(matches!(
            route_event(&config, ev, no_live).unwrap(),
            DispatchIntent::CreateSession { .. }
        ));
    }

    #[test]
    fn unassign_stops_live_and_ignores_dead() {
        let config = Config {
            repositories: vec![repo("r1")],
            ..Config::default()
        };
        let mut ev = assign_event(&[]);
        ev.kind = EventKind::Unassign;
        let live = SessionKey::new("r1", "iss-1");
        let lk = live.clone();
        assert!(matches!(
            route_event(&config, ev.clone(), move |_, _| Some(lk.clone())).unwrap(),
            DispatchIntent::StopSession { key, .. } if key == live
        ));
        assert!(matches!(
            route_event(&config, ev, no_live).unwrap(),
            DispatchIntent::Ignore { .. }
        ));
    }

    #[test]
    fn tool_policy_preset_expansion_and_subtraction() {
        let mut r = repo("r1");
        r.allowed_tools = Some(ToolPolicy::Preset(ToolPreset::All));
        r.disallowed_tools = vec!["Bash".into()];
        let rule = PromptRule {
            allowed_tools: Some(ToolPolicy::Preset(ToolPreset::Safe)),
            disallowed_tools: vec!["Write".into()],
            ..PromptRule::default()
        };
        let tools = resolve_tools(&rule, &r);
        assert!(tools.contains(&"Read".to_string()));
        assert!(tools.contains(&"Edit".to_string()));
        assert!(!tools.contains(&"Write".to_string()), "rule disallow");
        assert!(!tools.contains(&"Bash".to_string()), "repo disallow");
        assert!(!tools.contains(&"Task".to_string()), "not in rule preset");
    }

    #[test]
    fn explicit_rule_list_intersects_repo_default() {
        let mut r = repo("r1");
        r.allowed_tools = Some(ToolPolicy::Preset(ToolPreset::ReadOnly));
        let rule = PromptRule {
            allowed_tools: Some(ToolPolicy::Explicit(vec![
                "Read".into(),
                "Bash".into(),
            ])),
            ..PromptRule::default()
        };
        let tools = resolve_tools(&rule, &r);
        assert_eq!(tools, vec!["Read".to_string()], "Bash not in repo default");
    }

    #[test]
    fn chat_events_key_by_thread() {
        let mut r = repo("r1");
        r.channel_bindings = vec!["C1".into()];
        let config = Config {
            repositories: vec![r],
            ..Config::default()
        };
        let mut ev = assign_event(&[]);
        ev.transport = TransportKind::Chat;
        ev.surface.channel_id = Some("C1".into());
        ev.surface.thread_id = Some("111.222".into());
        match route_event(&config, ev, no_live).unwrap() {
            DispatchIntent::CreateSession { key, .. } => {
                assert_eq!(key.thread_id, "111.222");
            }
            other => panic!("expected CreateSession, got {other:?}"),
        }
    }
}
