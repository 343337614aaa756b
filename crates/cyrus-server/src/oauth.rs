// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! OAuth callback brokering.
//!
//! `cyrus auth` opens the provider's consent page in a browser and then
//! waits on a pending exchange here. The shared server's `GET /callback`
//! completes it by `state` parameter. Pending exchanges expire after five
//! minutes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

const OAUTH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum OauthError {
    #[error("no authorization code arrived within 5 minutes")]
    Timeout,
    #[error("callback carried an unknown state token")]
    UnknownState,
    #[error("authorization flow was abandoned")]
    Abandoned,
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<String>>,
}

/// Connects `GET /callback` to whoever is waiting for the code.
#[derive(Clone, Default)]
pub struct OauthBroker {
    pending: Arc<Mutex<Pending>>,
}

impl OauthBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a flow: returns the `state` token to embed in the consent URL
    /// and a future resolving to the authorization code.
    pub fn begin(&self) -> (String, impl std::future::Future<Output = Result<String, OauthError>>) {
        let state = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("oauth lock")
            .waiters
            .insert(state.clone(), tx);

        let pending = self.pending.clone();
        let state_for_cleanup = state.clone();
        let fut = async move {
            let result = tokio::time::timeout(OAUTH_TIMEOUT, rx).await;
            pending
                .lock()
                .expect("oauth lock")
                .waiters
                .remove(&state_for_cleanup);
            match result {
                Ok(Ok(code)) => Ok(code),
                Ok(Err(_)) => Err(OauthError::Abandoned),
                Err(_) => Err(OauthError::Timeout),
            }
        };
        (state, fut)
    }

    /// Complete a flow from the HTTP callback.
    pub fn complete(&self, state: &str, code: String) -> Result<(), OauthError> {
        let tx = self
            .pending
            .lock()
            .expect("oauth lock")
            .waiters
            .remove(state)
            .ok_or(OauthError::UnknownState)?;
        if tx.send(code).is_err() {
            warn!("oauth waiter dropped before completion");
            return Err(OauthError::Abandoned);
        }
        debug!("oauth exchange completed");
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_then_complete_delivers_code() {
        let broker = OauthBroker::new();
        let (state, fut) = broker.begin();
        broker.complete(&state, "auth-code-1".into()).unwrap();
        assert_eq!(fut.await.unwrap(), "auth-code-1");
    }

    #[tokio::test]
    async fn unknown_state_is_rejected() {
        let broker = OauthBroker::new();
        assert!(matches!(
            broker.complete("nope", "code".into()),
            Err(OauthError::UnknownState)
        ));
    }

    #[tokio::test]
    async fn state_tokens_are_single_use() {
        let broker = OauthBroker::new();
        let (state, fut) = broker.begin();
        broker.complete(&state, "first".into()).unwrap();
        assert!(matches!(
            broker.complete(&state, "second".into()),
            Err(OauthError::UnknownState)
        ));
        assert_eq!(fut.await.unwrap(), "first");
    }
}
