// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat-surface mention transport.
//!
//! Serves `POST /chat-webhook` with the chat platform's HMAC scheme
//! (`x-slack-signature` / `x-slack-request-timestamp`, the `v0` base-string
//! construction). The URL-verification handshake is answered in-line with
//! the challenge echo and never forwarded.

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

use cyrus_protocol::{EventKind, InboundEvent, SurfaceRefs, TransportKind};

use crate::verify::{verify_request, VerifyMode};
use crate::{accepted, EventTransport};

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

const AUTH_WARN_EVERY: u64 = 25;

#[derive(Clone)]
struct ChatState {
    mode: VerifyMode,
    events: mpsc::Sender<InboundEvent>,
    auth_failures: Arc<AtomicU64>,
}

pub struct ChatMentionTransport {
    state: ChatState,
    path: String,
}

impl ChatMentionTransport {
    pub fn new(mode: VerifyMode, events: mpsc::Sender<InboundEvent>) -> Self {
        Self {
            state: ChatState {
                mode,
                events,
                auth_failures: Arc::new(AtomicU64::new(0)),
            },
            path: "/chat-webhook".to_string(),
        }
    }
}

impl EventTransport for ChatMentionTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Chat
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.path, post(chat_webhook_handler))
            .with_state(self.state.clone())
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatPayload {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event_id: String,
        event: ChatEvent,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatEvent {
    AppMention {
        #[serde(default)]
        user: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        channel: String,
        #[serde(default)]
        ts: String,
        #[serde(default)]
        thread_ts: Option<String>,
    },
    Message {
        #[serde(default)]
        user: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        channel: String,
        #[serde(default)]
        ts: String,
        #[serde(default)]
        thread_ts: Option<String>,
    },
    #[serde(other)]
    Other,
}

fn normalize(event_id: String, event: ChatEvent) -> Option<InboundEvent> {
    let (kind, user, text, channel, ts, thread_ts) = match event {
        ChatEvent::AppMention {
            user,
            text,
            channel,
            ts,
            thread_ts,
        } => {
            // A mention inside an existing thread continues it; a top-level
            // mention starts a new one.
            let kind = if thread_ts.is_some() {
                EventKind::Mention
            } else {
                EventKind::NewThread
            };
            (kind, user, text, channel, ts, thread_ts)
        }
        ChatEvent::Message {
            user,
            text,
            channel,
            ts,
            thread_ts,
        } => {
            // Plain messages only matter as replies inside tracked threads.
            thread_ts.as_ref()?;
            (EventKind::Reply, user, text, channel, ts, thread_ts)
        }
        ChatEvent::Other => return None,
    };

    Some(InboundEvent {
        transport: TransportKind::Chat,
        envelope_id: event_id,
        kind,
        author: user,
        content: text,
        attachments: Vec::new(),
        surface: SurfaceRefs {
            channel_id: Some(channel),
            thread_id: thread_ts.or(Some(ts.clone())),
            comment_id: Some(ts),
        },
        occurred_at: Utc::now(),
        issue: None,
    })
}

async fn chat_webhook_handler(
    State(state): State<ChatState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    if let Err(e) = verify_request(&state.mode, timestamp, auth, signature, &body) {
        let n = state.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n % AUTH_WARN_EVERY == 1 {
            warn!(failures = n, "chat webhook auth failed: {e}");
        }
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: ChatPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("malformed chat payload: {e}");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    match payload {
        ChatPayload::UrlVerification { challenge } => {
            // Sent once when the webhook is configured; echoed, not routed.
            (StatusCode::OK, challenge).into_response()
        }
        ChatPayload::EventCallback { event_id, event } => {
            match normalize(event_id, event) {
                Some(ev) => {
                    debug!(envelope = %ev.envelope_id, kind = ?ev.kind, "chat event");
                    if state.events.send(ev).await.is_err() {
                        return (StatusCode::INTERNAL_SERVER_ERROR, "worker shutting down")
                            .into_response();
                    }
                }
                None => debug!("unhandled chat event type"),
            }
            (StatusCode::OK, accepted()).into_response()
        }
    }
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

    const SECRET: &[u8] = b"chat-secret";

    fn sign(body: &[u8]) -> (String, String) {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .to_string();
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET).unwrap();
        mac.update(b"v0:");
        mac.update(ts.as_bytes());
        mac.update(b":");
        mac.update(body);
        let sig = format!("v0={}", hex::encode(mac.finalize().into_bytes()));
        (ts, sig)
    }

    fn transport() -> (ChatMentionTransport, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (ChatMentionTransport::new(VerifyMode::hmac(SECRET), tx), rx)
    }

    async fn deliver(t: &ChatMentionTransport, body: Vec<u8>) -> Response {
        let (ts, sig) = sign(&body);
        t.router()
            .oneshot(
                Request::post("/chat-webhook")
                    .header(TIMESTAMP_HEADER, ts)
                    .header(SIGNATURE_HEADER, sig)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge() {
        let (t, _rx) = transport();
        let body =
            serde_json::to_vec(&serde_json::json!({"type": "url_verification", "challenge": "c0ffee"}))
                .unwrap();
        let response = deliver(&t, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"c0ffee");
    }

    #[tokio::test]
    async fn top_level_mention_is_new_thread() {
        let (t, mut rx) = transport();
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "event_callback",
            "event_id": "Ev1",
            "event": {
                "type": "app_mention",
                "user": "U1", "text": "@cyrus fix ENG-1",
                "channel": "C1", "ts": "111.222"
            }
        }))
        .unwrap();
        deliver(&t, body).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::NewThread);
        assert_eq!(ev.surface.channel_id.as_deref(), Some("C1"));
        assert_eq!(ev.surface.thread_id.as_deref(), Some("111.222"));
    }

    #[tokio::test]
    async fn threaded_message_is_reply() {
        let (t, mut rx) = transport();
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "event_callback",
            "event_id": "Ev2",
            "event": {
                "type": "message",
                "user": "U2", "text": "any update?",
                "channel": "C1", "ts": "333.444", "thread_ts": "111.222"
            }
        }))
        .unwrap();
        deliver(&t, body).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Reply);
        assert_eq!(ev.surface.thread_id.as_deref(), Some("111.222"));
    }

    #[tokio::test]
    async fn untracked_top_level_message_is_dropped() {
        let (t, mut rx) = transport();
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "event_callback",
            "event_id": "Ev3",
            "event": {
                "type": "message",
                "user": "U2", "text": "chatter",
                "channel": "C1", "ts": "555.666"
            }
        }))
        .unwrap();
        let response = deliver(&t, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err(), "no event for channel chatter");
    }

    #[tokio::test]
    async fn unsigned_request_is_401() {
        let (t, _rx) = transport();
        let response = t
            .router()
            .oneshot(
                Request::post("/chat-webhook")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
