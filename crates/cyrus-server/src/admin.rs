// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Admin API.
//!
//! Every `/admin/*` route (and the opt-in `/github-token`) requires
//! `Authorization: Bearer <admin-token>`, compared in constant time. Failed
//! attempts are rate limited per IP with the GCRA limiter; loopback is
//! exempt so local tooling is never locked out.
//!
//! Token material in responses is masked — all but the last 4 characters.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tracing::warn;

use cyrus_config::{mask_secret, ConfigManager, CyrusEnv, Repository};
use cyrus_protocol::SessionSnapshot;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Callback the EdgeWorker installs so the admin API can list live sessions
/// without the server crate depending on the orchestration crate.
pub type SessionLister = Arc<dyn Fn() -> Vec<SessionSnapshot> + Send + Sync>;

#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<ConfigManager>,
    pub env: Arc<CyrusEnv>,
    admin_token: Arc<String>,
    sessions: SessionLister,
    limiter: Arc<IpLimiter>,
    /// `/github-token` is served only when the operator opted in.
    manage_gh_auth: bool,
}

impl AdminState {
    pub fn new(
        config: Arc<ConfigManager>,
        env: Arc<CyrusEnv>,
        admin_token: String,
        sessions: SessionLister,
    ) -> Self {
        // 5 failed attempts per minute, burst of 2 — then 429.
        let quota = Quota::per_minute(NonZeroU32::new(5).expect("nonzero"))
            .allow_burst(NonZeroU32::new(2).expect("nonzero"));
        let manage_gh_auth = env.manage_gh_auth;
        Self {
            config,
            env,
            admin_token: Arc::new(admin_token),
            sessions,
            limiter: Arc::new(RateLimiter::keyed(quota)),
            manage_gh_auth,
        }
    }

    pub fn router(&self) -> Router {
        let mut admin = Router::new()
            .route("/admin/config", get(get_config))
            .route("/admin/repositories", post(add_repository))
            .route(
                "/admin/repositories/:id",
                post(update_repository).delete(remove_repository),
            )
            .route("/admin/env", post(set_env))
            .route("/admin/sessions", get(list_sessions));
        if self.manage_gh_auth {
            admin = admin.route("/github-token", post(set_github_token));
        }
        admin
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                admin_auth_mw,
            ))
            .with_state(self.clone())
    }
}

// ── Auth middleware ───────────────────────────────────────────────────────────

/// Bearer auth for the admin surface. Only failed attempts consume
/// rate-limit budget, so a legitimate dashboard is never throttled by its
/// own traffic.
async fn admin_auth_mw(
    State(state): State<AdminState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let ok = provided
        .map(|p| {
            p.as_bytes().ct_eq(state.admin_token.as_bytes()).unwrap_u8() == 1
        })
        .unwrap_or(false);

    if ok {
        return next.run(req).await;
    }

    let ip = addr.ip();
    if !ip.is_loopback() && state.limiter.check_key(&ip).is_err() {
        warn!(%ip, "admin rate limit exceeded after repeated auth failures");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(axum::http::header::RETRY_AFTER, "60")],
            "Too Many Requests",
        )
            .into_response();
    }
    (StatusCode::UNAUTHORIZED, "invalid admin token").into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// The config with every secret masked to its last 4 characters.
async fn get_config(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let config = state.config.get();
    let mut value = serde_json::to_value(config.as_ref()).unwrap_or_default();

    if let Some(repos) = value
        .get_mut("repositories")
        .and_then(|r| r.as_array_mut())
    {
        for repo in repos {
            if let Some(token) = repo.get_mut("linearToken") {
                if let Some(s) = token.as_str() {
                    *token = serde_json::Value::String(mask_secret(s));
                }
            }
        }
    }
    if let Some(token) = value.get_mut("ngrokAuthToken") {
        if let Some(s) = token.as_str() {
            *token = serde_json::Value::String(mask_secret(s));
        }
    }
    Json(value)
}

async fn add_repository(
    State(state): State<AdminState>,
    Json(repo): Json<Repository>,
) -> Response {
    match state.config.add_repository(repo) {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"success": true}))).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn update_repository(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(mut repo): Json<Repository>,
) -> Response {
    repo.id = id;
    match state.config.update_repository(repo) {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"success": true}))).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn remove_repository(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    match state.config.remove_repository(&id) {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"success": true}))).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// Persist environment secrets into `<cyrus_home>/.env`. Takes effect on
/// the next start.
async fn set_env(
    State(state): State<AdminState>,
    Json(vars): Json<BTreeMap<String, String>>,
) -> Response {
    match state.env.persist_env_vars(&vars) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"success": true}))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

async fn list_sessions(State(state): State<AdminState>) -> Json<Vec<SessionSnapshot>> {
    Json((state.sessions)())
}

#[derive(serde::Deserialize)]
struct GithubTokenBody {
    token: String,
}

async fn set_github_token(
    State(state): State<AdminState>,
    Json(body): Json<GithubTokenBody>,
) -> Response {
    let mut vars = BTreeMap::new();
    vars.insert("GITHUB_TOKEN".to_string(), body.token);
    match state.env.persist_env_vars(&vars) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"success": true}))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use cyrus_config::ConfigStore;
    use tower::util::ServiceExt;

    fn test_state(dir: &std::path::Path) -> AdminState {
        let store = ConfigStore::new(dir.join("config.json"), 3);
        let manager = Arc::new(ConfigManager::new(store).unwrap());
        manager
            .add_repository(Repository {
                id: "r1".into(),
                name: "Repo One".into(),
                repository_path: "/srv/r1".into(),
                linear_workspace_id: "ws".into(),
                linear_token: "lin_api_secret_9876".into(),
                ..Repository::default()
            })
            .unwrap();
        let env = Arc::new(CyrusEnv {
            cyrus_home: dir.to_path_buf(),
            base_url: None,
            host_external: None,
            cloudflare_token: None,
            proxy_url: None,
            linear_api_token: None,
            slack_bot_token: None,
            manage_gh_auth: false,
        });
        AdminState::new(manager, env, "admin-tok".into(), Arc::new(Vec::new))
    }

    fn with_conn_info(router: Router) -> Router {
        // ConnectInfo is normally injected by the server; tests fake it.
        router.layer(axum::Extension(ConnectInfo(SocketAddr::from((
            [127, 0, 0, 1],
            9999,
        )))))
    }

    async fn send(
        state: &AdminState,
        auth: Option<&str>,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let mut req = HttpRequest::builder().method(method).uri(path);
        if let Some(auth) = auth {
            req = req.header("authorization", auth);
        }
        let req = match body {
            Some(v) => req
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&v).unwrap()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        with_conn_info(state.router()).oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = send(&state, None, "GET", "/admin/config", None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn config_is_masked() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = send(&state, Some("Bearer admin-tok"), "GET", "/admin/config", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["repositories"][0]["linearToken"], "****9876");
    }

    #[tokio::test]
    async fn repository_lifecycle_via_admin() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let new_repo = serde_json::json!({
            "id": "r2", "name": "Two", "repositoryPath": "/srv/r2",
            "linearWorkspaceId": "ws", "linearToken": "tok2"
        });
        let resp = send(
            &state,
            Some("Bearer admin-tok"),
            "POST",
            "/admin/repositories",
            Some(new_repo),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.config.get().repository("r2").is_some());

        let resp = send(
            &state,
            Some("Bearer admin-tok"),
            "DELETE",
            "/admin/repositories/r2",
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.config.get().repository("r2").is_none());

        let resp = send(
            &state,
            Some("Bearer admin-tok"),
            "DELETE",
            "/admin/repositories/ghost",
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn env_secrets_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = send(
            &state,
            Some("Bearer admin-tok"),
            "POST",
            "/admin/env",
            Some(serde_json::json!({"LINEAR_API_TOKEN": "lin_new"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let text = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(text.contains("LINEAR_API_TOKEN=lin_new"));
    }

    #[tokio::test]
    async fn github_token_route_requires_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = send(
            &state,
            Some("Bearer admin-tok"),
            "POST",
            "/github-token",
            Some(serde_json::json!({"token": "ghp_x"})),
        )
        .await;
        // manage_gh_auth is false in the test env, so the route is absent.
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
