// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Code-host comment transport.
//!
//! Serves `POST /github-webhook`. The code host signs the raw body with
//! `X-Hub-Signature-256: sha256=<hex>` (no timestamp; the delivery id in
//! `X-GitHub-Delivery` is the dedup key). Issue and PR comments that
//! reference a tracked issue key become replies.

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
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cyrus_protocol::{EventKind, InboundEvent, IssueRefs, SurfaceRefs, TransportKind};

use crate::verify::{verify_bearer, verify_plain_hmac, VerifyError, VerifyMode};
use crate::{accepted, EventTransport};

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const DELIVERY_HEADER: &str = "x-github-delivery";
const EVENT_HEADER: &str = "x-github-event";

const AUTH_WARN_EVERY: u64 = 25;

#[derive(Clone)]
struct CodeHostState {
    mode: VerifyMode,
    events: mpsc::Sender<InboundEvent>,
    auth_failures: Arc<AtomicU64>,
}

pub struct CodeHostTransport {
    state: CodeHostState,
    path: String,
}

impl CodeHostTransport {
    pub fn new(mode: VerifyMode, events: mpsc::Sender<InboundEvent>) -> Self {
        Self {
            state: CodeHostState {
                mode,
                events,
                auth_failures: Arc::new(AtomicU64::new(0)),
            },
            path: "/github-webhook".to_string(),
        }
    }
}

impl EventTransport for CodeHostTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CodeHost
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.path, post(codehost_webhook_handler))
            .with_state(self.state.clone())
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CodeHostPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    comment: Option<HostComment>,
    #[serde(default)]
    issue: Option<HostIssue>,
    #[serde(default)]
    repository: Option<HostRepository>,
}

#[derive(Debug, Deserialize)]
struct HostComment {
    id: u64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    user: Option<HostUser>,
}

#[derive(Debug, Deserialize)]
struct HostIssue {
    number: u64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct HostUser {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct HostRepository {
    #[serde(default)]
    full_name: String,
}

/// Tracked-issue keys look like `ENG-42`; the first one in the comment body
/// links the code-host thread back to the tracker issue.
fn extract_issue_key(body: &str) -> Option<String> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        // Candidate start: uppercase letter preceded by a non-alphanumeric.
        if bytes[i].is_ascii_uppercase()
            && (i == 0 || !bytes[i - 1].is_ascii_alphanumeric())
        {
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_uppercase() {
                j += 1;
            }
            if j > i && j < bytes.len() && bytes[j] == b'-' {
                let mut k = j + 1;
                while k < bytes.len() && bytes[k].is_ascii_digit() {
                    k += 1;
                }
                if k > j + 1 && (k == bytes.len() || !bytes[k].is_ascii_alphanumeric()) {
                    return Some(body[i..k].to_string());
                }
            }
            i = j.max(i + 1);
        } else {
            i += 1;
        }
    }
    None
}

fn normalize(delivery_id: String, event_name: &str, payload: CodeHostPayload) -> Option<InboundEvent> {
    if event_name != "issue_comment" || payload.action != "created" {
        return None;
    }
    let comment = payload.comment?;
    let issue_key = extract_issue_key(&comment.body)?;
    let issue_number = payload.issue.as_ref().map(|i| i.number).unwrap_or_default();

    Some(InboundEvent {
        transport: TransportKind::CodeHost,
        envelope_id: delivery_id,
        kind: EventKind::Reply,
        author: comment.user.map(|u| u.login).unwrap_or_default(),
        content: comment.body,
        attachments: Vec::new(),
        surface: SurfaceRefs {
            channel_id: payload.repository.map(|r| r.full_name),
            thread_id: Some(issue_number.to_string()),
            comment_id: Some(comment.id.to_string()),
        },
        occurred_at: Utc::now(),
        issue: Some(IssueRefs {
            issue_id: String::new(),
            issue_key,
            team_key: None,
            labels: Vec::new(),
        }),
    })
}

async fn codehost_webhook_handler(
    State(state): State<CodeHostState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let verified: Result<(), VerifyError> = match &state.mode {
        VerifyMode::Hmac { secret } => verify_plain_hmac(secret, &body, signature),
        VerifyMode::Bearer { secret } => verify_bearer(secret, auth),
    };
    if let Err(e) = verified {
        let n = state.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n % AUTH_WARN_EVERY == 1 {
            warn!(failures = n, "code-host webhook auth failed: {e}");
        }
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let delivery_id = headers
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if delivery_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing delivery id").into_response();
    }
    let event_name = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let payload: CodeHostPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("malformed code-host payload: {e}");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    match normalize(delivery_id, event_name, payload) {
        Some(event) => {
            debug!(envelope = %event.envelope_id, "code-host event");
            if state.events.send(event).await.is_err() {
                return (StatusCode::INTERNAL_SERVER_ERROR, "worker shutting down")
                    .into_response();
            }
        }
        None => debug!("code-host event without tracked issue reference dropped"),
    }
    (StatusCode::OK, accepted()).into_response()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::util::ServiceExt;

    const SECRET: &[u8] = b"gh-secret";

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn comment_body(text: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "action": "created",
            "comment": { "id": 77, "body": text, "user": { "login": "octocat" } },
            "issue": { "number": 12, "title": "PR title" },
            "repository": { "full_name": "acme/widget" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn issue_comment_with_tracked_key_becomes_reply() {
        let (tx, mut rx) = mpsc::channel(8);
        let t = CodeHostTransport::new(VerifyMode::hmac(SECRET), tx);
        let body = comment_body("Relates to ENG-42, please take a look");

        let response = t
            .router()
            .oneshot(
                Request::post("/github-webhook")
                    .header(SIGNATURE_HEADER, sign(&body))
                    .header(DELIVERY_HEADER, "d-1")
                    .header(EVENT_HEADER, "issue_comment")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Reply);
        assert_eq!(ev.envelope_id, "d-1");
        assert_eq!(ev.author, "octocat");
        assert_eq!(ev.issue.unwrap().issue_key, "ENG-42");
        assert_eq!(ev.surface.channel_id.as_deref(), Some("acme/widget"));
    }

    #[tokio::test]
    async fn comment_without_issue_key_is_acked_and_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let t = CodeHostTransport::new(VerifyMode::hmac(SECRET), tx);
        let body = comment_body("looks good to me!");

        let response = t
            .router()
            .oneshot(
                Request::post("/github-webhook")
                    .header(SIGNATURE_HEADER, sign(&body))
                    .header(DELIVERY_HEADER, "d-2")
                    .header(EVENT_HEADER, "issue_comment")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrong_hmac_is_401() {
        let (tx, _rx) = mpsc::channel(8);
        let t = CodeHostTransport::new(VerifyMode::hmac(SECRET), tx);
        let body = comment_body("ENG-1");
        let response = t
            .router()
            .oneshot(
                Request::post("/github-webhook")
                    .header(SIGNATURE_HEADER, "sha256=deadbeef")
                    .header(DELIVERY_HEADER, "d-3")
                    .header(EVENT_HEADER, "issue_comment")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn issue_key_extraction() {
        assert_eq!(extract_issue_key("see ENG-42 for details"), Some("ENG-42".into()));
        assert_eq!(extract_issue_key("ENG-42"), Some("ENG-42".into()));
        assert_eq!(extract_issue_key("(OPS-7)"), Some("OPS-7".into()));
        assert_eq!(extract_issue_key("no key here"), None);
        assert_eq!(extract_issue_key("lowercase eng-42"), None);
        assert_eq!(extract_issue_key("UUID-like A-"), None);
    }
}
