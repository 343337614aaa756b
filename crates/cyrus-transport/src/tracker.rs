// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Issue-tracker webhook transport.
//!
//! Serves `POST /webhook`. Direct deliveries are HMAC-signed with the
//! `v0:<ts>:<body>` scheme; deliveries forwarded through the proxy carry a
//! Bearer secret instead. Payloads describe assignments, comments,
//! unassignments, and stop commands:
//!
//! ```json
//! { "action": "assign", "webhookId": "…", "createdAt": "…",
//!   "actor": { "name": "alice" },
//!   "issue": { "id": "…", "identifier": "ENG-42", "teamKey": "ENG",
//!              "labels": ["Bug"] },
//!   "comment": { "id": "…", "body": "…", "parentId": "…" } }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cyrus_protocol::{EventKind, InboundEvent, IssueRefs, SurfaceRefs, TransportKind};

use crate::verify::{verify_request, VerifyMode};
use crate::{accepted, EventTransport};

const SIGNATURE_HEADER: &str = "x-webhook-signature";
const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Log only every Nth auth failure to keep a misconfigured sender from
/// flooding the log.
const AUTH_WARN_EVERY: u64 = 25;

#[derive(Clone)]
struct TrackerState {
    mode: VerifyMode,
    events: mpsc::Sender<InboundEvent>,
    auth_failures: Arc<AtomicU64>,
}

pub struct TrackerWebhookTransport {
    state: TrackerState,
    path: String,
}

impl TrackerWebhookTransport {
    pub fn new(mode: VerifyMode, events: mpsc::Sender<InboundEvent>) -> Self {
        Self {
            state: TrackerState {
                mode,
                events,
                auth_failures: Arc::new(AtomicU64::new(0)),
            },
            path: "/webhook".to_string(),
        }
    }
}

impl EventTransport for TrackerWebhookTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tracker
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.path, post(tracker_webhook_handler))
            .with_state(self.state.clone())
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerPayload {
    action: String,
    #[serde(default)]
    webhook_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    actor: Option<Actor>,
    #[serde(default)]
    issue: Option<IssueNode>,
    #[serde(default)]
    comment: Option<CommentNode>,
    /// Flat form used by older senders: `{"action":"assign","issueId":"T-1"}`.
    #[serde(default)]
    issue_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    id: String,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    team_key: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentNode {
    id: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    parent_id: Option<String>,
}

fn normalize(payload: TrackerPayload) -> Option<InboundEvent> {
    let kind = match payload.action.as_str() {
        "assign" | "issueAssignedToYou" => EventKind::NewThread,
        "comment" | "issueCommentMention" | "issueNewComment" => EventKind::Reply,
        "unassign" | "issueUnassignedFromYou" => EventKind::Unassign,
        "stop" => EventKind::Stop,
        _ => EventKind::Ignore,
    };

    let issue = match (&payload.issue, &payload.issue_id) {
        (Some(node), _) => Some(IssueRefs {
            issue_id: node.id.clone(),
            issue_key: if node.identifier.is_empty() {
                node.id.clone()
            } else {
                node.identifier.clone()
            },
            team_key: node.team_key.clone(),
            labels: node.labels.clone(),
        }),
        (None, Some(id)) => Some(IssueRefs {
            issue_id: id.clone(),
            issue_key: id.clone(),
            team_key: None,
            labels: Vec::new(),
        }),
        (None, None) => None,
    };

    let envelope_id = payload
        .webhook_id
        .clone()
        .or_else(|| {
            // Without a delivery id, derive one from the stable payload
            // coordinates so retries still collapse.
            issue.as_ref().map(|i| {
                format!(
                    "{}:{}:{}",
                    payload.action,
                    i.issue_id,
                    payload.comment.as_ref().map(|c| c.id.as_str()).unwrap_or("")
                )
            })
        })?;

    Some(InboundEvent {
        transport: TransportKind::Tracker,
        envelope_id,
        kind,
        author: payload.actor.map(|a| a.name).unwrap_or_default(),
        content: payload
            .comment
            .as_ref()
            .map(|c| c.body.clone())
            .unwrap_or_default(),
        attachments: Vec::new(),
        surface: SurfaceRefs {
            channel_id: None,
            thread_id: payload
                .comment
                .as_ref()
                .and_then(|c| c.parent_id.clone()),
            comment_id: payload.comment.as_ref().map(|c| c.id.clone()),
        },
        occurred_at: payload.created_at.unwrap_or_else(Utc::now),
        issue,
    })
}

async fn tracker_webhook_handler(
    State(state): State<TrackerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let auth = header_str(&headers, "authorization");

    if let Err(e) = verify_request(
        &state.mode,
        timestamp,
        if auth.is_empty() { None } else { Some(auth) },
        signature,
        &body,
    ) {
        let n = state.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n % AUTH_WARN_EVERY == 1 {
            warn!(failures = n, "tracker webhook auth failed: {e}");
        }
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: TrackerPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("malformed tracker payload: {e}");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    match normalize(payload) {
        Some(event) => {
            debug!(envelope = %event.envelope_id, kind = ?event.kind, "tracker event");
            if state.events.send(event).await.is_err() {
                return (StatusCode::INTERNAL_SERVER_ERROR, "worker shutting down")
                    .into_response();
            }
            (StatusCode::OK, accepted()).into_response()
        }
        // Payloads without issue coordinates are acknowledged and dropped.
        None => (StatusCode::OK, accepted()).into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

// ── Unit tests ────────────────────────────────────────────────────────────────
