// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The shared application server.
//!
//! One listener hosts every registered transport's verification endpoint,
//! the OAuth redirect receiver, and the admin surface:
//!
//! ```text
//! POST /webhook           tracker transport (HMAC or Bearer)
//! POST /chat-webhook      chat transport    (HMAC + challenge echo)
//! POST /github-webhook    code-host transport
//! GET  /callback          OAuth receiver → OauthBroker
//! *    /admin/*           Bearer admin token
//! POST /github-token      opt-in, Bearer admin token
//! GET  /healthz           liveness, unauthenticated
//! ```
//!
//! Shutdown is graceful: the listener stops accepting, in-flight requests
//! finish, and the caller (EdgeWorker) drains sinks and signals runners
//! within its own grace budget.

use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cyrus_transport::EventTransport;

use crate::admin::AdminState;
use crate::oauth::OauthBroker;

pub struct SharedServer {
    router: Router,
}

/// Running server: local address plus the shutdown trigger.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("server task join error: {e}");
        }
    }
}

impl SharedServer {
    pub fn new(
        transports: &[Box<dyn EventTransport>],
        oauth: OauthBroker,
        admin: Option<AdminState>,
    ) -> Self {
        let mut router = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/callback", get(oauth_callback).with_state(oauth));

        for transport in transports {
            info!(
                path = transport.path(),
                kind = %transport.kind(),
                "transport endpoint registered"
            );
            router = router.merge(transport.router());
        }
        if let Some(admin) = admin {
            router = router.merge(admin.router());
        }
        // Webhook payloads are small; anything past 2 MiB is hostile.
        let router =
            router.layer(tower_http::limit::RequestBodyLimitLayer::new(2 * 1024 * 1024));
        Self { router }
    }

    /// Bind and serve until the returned handle is shut down.
    pub async fn bind(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "shared application server listening");

        let shutdown = CancellationToken::new();
        let shutdown_inner = shutdown.clone();
        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_inner.cancelled().await });
            if let Err(e) = serve.await {
                warn!("server error: {e}");
            }
            info!("shared application server stopped");
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }
}

#[derive(serde::Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    error: Option<String>,
}

async fn oauth_callback(
    State(broker): State<OauthBroker>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        warn!("oauth provider returned error: {error}");
        return (
            StatusCode::BAD_REQUEST,
            format!("Authorization failed: {error}"),
        )
            .into_response();
    }
    match broker.complete(&query.state, query.code) {
        Ok(()) => (
            StatusCode::OK,
            "Authorization complete — you can close this tab.",
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cyrus_protocol::InboundEvent;
    use cyrus_transport::{TrackerWebhookTransport, VerifyMode};
    use tokio::sync::mpsc;

    fn test_server() -> (SharedServer, OauthBroker, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let transports: Vec<Box<dyn EventTransport>> = vec![Box::new(
            TrackerWebhookTransport::new(VerifyMode::bearer("proxy-secret"), tx),
        )];
        let oauth = OauthBroker::new();
        let server = SharedServer::new(&transports, oauth.clone(), None);
        (server, oauth, rx)
    }

    #[tokio::test]
    async fn serves_health_and_shuts_down() {
        let (server, _oauth, _rx) = test_server();
        let handle = server
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let url = format!("http://{}/healthz", handle.local_addr);
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "ok");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn webhook_route_is_mounted() {
        let (server, _oauth, mut rx) = test_server();
        let handle = server
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let url = format!("http://{}/webhook", handle.local_addr);
        let resp = reqwest::Client::new()
            .post(&url)
            .header("authorization", "Bearer proxy-secret")
            .json(&serde_json::json!({
                "action": "assign", "issueId": "T-1", "webhookId": "e1"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.envelope_id, "e1");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn oauth_callback_completes_pending_flow() {
        let (server, oauth, _rx) = test_server();
        let handle = server
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        let (state, fut) = oauth.begin();
        let url = format!(
            "http://{}/callback?code=abc123&state={state}",
            handle.local_addr
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(fut.await.unwrap(), "abc123");

        // A second hit with the same state is rejected.
        let resp = reqwest::get(&format!(
            "http://{}/callback?code=zzz&state={state}",
            handle.local_addr
        ))
        .await
        .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        handle.shutdown().await;
    }
}
