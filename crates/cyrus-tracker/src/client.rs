// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The issue-tracker API client.
//!
//! [`IssueTracker`] is the seam the rest of the worker programs against;
//! [`HttpTracker`] speaks the tracker's GraphQL endpoint with a per-repo
//! token. Tests substitute their own implementations.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use cyrus_protocol::{Activity, ActivityKind};

use crate::types::{Comment, Issue, Label, Team, TrackerUser, WorkflowState};

pub const DEFAULT_API_URL: &str = "https://api.linear.app/graphql";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker returned HTTP {status}")]
    Status { status: u16 },
    #[error("tracker API error: {0}")]
    Api(String),
    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },
}

/// Everything the worker needs from a ticketing backend.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_issue(&self, id: &str) -> Result<Issue, TrackerError>;
    async fn fetch_comment(&self, id: &str) -> Result<Comment, TrackerError>;
    async fn fetch_user(&self, id: &str) -> Result<TrackerUser, TrackerError>;
    async fn fetch_team(&self, key: &str) -> Result<Team, TrackerError>;
    async fn fetch_labels(&self, issue_id: &str) -> Result<Vec<Label>, TrackerError>;
    async fn fetch_workflow_states(&self, team_id: &str)
        -> Result<Vec<WorkflowState>, TrackerError>;

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<Comment, TrackerError>;

    /// Open an agent session on the issue; returns the tracker's session id.
    async fn create_agent_session(&self, issue_id: &str) -> Result<String, TrackerError>;

    /// Post one activity into an agent session; returns the activity id.
    async fn post_activity(
        &self,
        agent_session_id: &str,
        activity: &Activity,
    ) -> Result<String, TrackerError>;

    /// Replace a previously posted (ephemeral) activity in place.
    async fn replace_activity(
        &self,
        agent_session_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<String, TrackerError>;

    /// Upload a file; returns the public URL to reference in activity bodies.
    async fn upload_attachment(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, TrackerError>;
}

/// GraphQL-over-HTTP implementation.
pub struct HttpTracker {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl HttpTracker {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_url(DEFAULT_API_URL, token)
    }

    pub fn with_url(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    /// Check that the configured token is accepted by the API. Returns the
    /// authenticated account's display name.
    pub async fn verify_token(&self) -> Result<String, TrackerError> {
        let data = self
            .graphql(r#"query { viewer { id name } }"#, json!({}))
            .await?;
        data.pointer("/viewer/name")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| TrackerError::Api("viewer query returned no name".into()))
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, TrackerError> {
        debug!(url = %self.api_url, "tracker graphql request");
        let resp = self
            .client
            .post(&self.api_url)
            .header("Authorization", &self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerError::Status {
                status: status.as_u16(),
            });
        }
        let body: Value = resp.json().await?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            let message = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TrackerError::Api(message));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

fn parse_issue(node: &Value) -> Option<Issue> {
    Some(Issue {
        id: node.get("id")?.as_str()?.to_string(),
        identifier: node
            .get("identifier")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        title: node
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        description: node
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        labels: node
            .pointer("/labels/nodes")
            .and_then(|v| v.as_array())
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| {
                        Some(Label {
                            id: n.get("id")?.as_str()?.to_string(),
                            name: n.get("name")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        team_key: node
            .pointer("/team/key")
            .and_then(|v| v.as_str())
            .map(String::from),
        assignee_id: node
            .pointer("/assignee/id")
            .and_then(|v| v.as_str())
            .map(String::from),
        state: node.pointer("/state").and_then(|s| {
            Some(WorkflowState {
                id: s.get("id")?.as_str()?.to_string(),
                name: s.get("name")?.as_str()?.to_string(),
                state_type: s
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
        }),
    })
}

/// The tracker's activity vocabulary uses different names than ours.
fn activity_type_name(kind: ActivityKind) -> &'static str {
    match kind {
        ActivityKind::Thought => "thought",
        ActivityKind::Action => "action",
        ActivityKind::Response => "response",
        ActivityKind::Error => "error",
        ActivityKind::Elicitation => "elicitation",
    }
}

#[async_trait]
impl IssueTracker for HttpTracker {
    async fn fetch_issue(&self, id: &str) -> Result<Issue, TrackerError> {
        let data = self
            .graphql(
                r#"query($id: String!) {
                     issue(id: $id) {
                       id identifier title description
                       labels { nodes { id name } }
                       team { key }
                       assignee { id }
                       state { id name type }
                     }
                   }"#,
                json!({ "id": id }),
            )
            .await?;
        data.get("issue")
            .and_then(parse_issue)
            .ok_or(TrackerError::NotFound {
                kind: "issue",
                id: id.to_string(),
            })
    }

    async fn fetch_comment(&self, id: &str) -> Result<Comment, TrackerError> {
        let data = self
            .graphql(
                r#"query($id: String!) {
                     comment(id: $id) {
                       id body parent { id }
                       user { id name }
                     }
                   }"#,
                json!({ "id": id }),
            )
            .await?;
        let node = data.get("comment").filter(|n| !n.is_null()).ok_or(
            TrackerError::NotFound {
                kind: "comment",
                id: id.to_string(),
            },
        )?;
        Ok(Comment {
            id: node
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            body: node
                .get("body")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            author: node.pointer("/user/id").and_then(|_| {
                Some(TrackerUser {
                    id: node.pointer("/user/id")?.as_str()?.to_string(),
                    name: node
                        .pointer("/user/name")?
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    is_bot: false,
                })
            }),
            parent_id: node
                .pointer("/parent/id")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    async fn fetch_user(&self, id: &str) -> Result<TrackerUser, TrackerError> {
        let data = self
            .graphql(
                r#"query($id: String!) { user(id: $id) { id name isMe } }"#,
                json!({ "id": id }),
            )
            .await?;
        let node = data.get("user").filter(|n| !n.is_null()).ok_or(
            TrackerError::NotFound {
                kind: "user",
                id: id.to_string(),
            },
        )?;
        Ok(TrackerUser {
            id: node
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            name: node
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            is_bot: false,
        })
    }

    async fn fetch_team(&self, key: &str) -> Result<Team, TrackerError> {
        let data = self
            .graphql(
                r#"query($key: String!) {
                     teams(filter: { key: { eq: $key } }) { nodes { id key name } }
                   }"#,
                json!({ "key": key }),
            )
            .await?;
        let node = data
            .pointer("/teams/nodes/0")
            .filter(|n| !n.is_null())
            .ok_or(TrackerError::NotFound {
                kind: "team",
                id: key.to_string(),
            })?;
        Ok(Team {
            id: node
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            key: node
                .get("key")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            name: node
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn fetch_labels(&self, issue_id: &str) -> Result<Vec<Label>, TrackerError> {
        Ok(self.fetch_issue(issue_id).await?.labels)
    }

    async fn fetch_workflow_states(
        &self,
        team_id: &str,
    ) -> Result<Vec<WorkflowState>, TrackerError> {
        let data = self
            .graphql(
                r#"query($teamId: ID) {
                     workflowStates(filter: { team: { id: { eq: $teamId } } }) {
                       nodes { id name type }
                     }
                   }"#,
                json!({ "teamId": team_id }),
            )
            .await?;
        Ok(data
            .pointer("/workflowStates/nodes")
            .and_then(|v| v.as_array())
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| {
                        Some(WorkflowState {
                            id: n.get("id")?.as_str()?.to_string(),
                            name: n.get("name")?.as_str()?.to_string(),
                            state_type: n
                                .get("type")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<Comment, TrackerError> {
        let data = self
            .graphql(
                r#"mutation($issueId: String!, $body: String!) {
                     commentCreate(input: { issueId: $issueId, body: $body }) {
                       comment { id body }
                     }
                   }"#,
                json!({ "issueId": issue_id, "body": body }),
            )
            .await?;
        let node = data
            .pointer("/commentCreate/comment")
            .filter(|n| !n.is_null())
            .ok_or_else(|| TrackerError::Api("commentCreate returned no comment".into()))?;
        Ok(Comment {
            id: node
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            body: node
                .get("body")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            author: None,
            parent_id: None,
        })
    }

    async fn create_agent_session(&self, issue_id: &str) -> Result<String, TrackerError> {
        let data = self
            .graphql(
                r#"mutation($issueId: String!) {
                     agentSessionCreate(input: { issueId: $issueId }) {
                       agentSession { id }
                     }
                   }"#,
                json!({ "issueId": issue_id }),
            )
            .await?;
        data.pointer("/agentSessionCreate/agentSession/id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| TrackerError::Api("agentSessionCreate returned no id".into()))
    }

    async fn post_activity(
        &self,
        agent_session_id: &str,
        activity: &Activity,
    ) -> Result<String, TrackerError> {
        let data = self
            .graphql(
                r#"mutation($sessionId: String!, $type: String!, $body: String!, $ephemeral: Boolean) {
                     agentActivityCreate(input: {
                       agentSessionId: $sessionId, type: $type, body: $body, ephemeral: $ephemeral
                     }) { agentActivity { id } }
                   }"#,
                json!({
                    "sessionId": agent_session_id,
                    "type": activity_type_name(activity.kind),
                    "body": activity.body,
                    "ephemeral": activity.ephemeral,
                }),
            )
            .await?;
        data.pointer("/agentActivityCreate/agentActivity/id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| TrackerError::Api("agentActivityCreate returned no id".into()))
    }

    async fn replace_activity(
        &self,
        agent_session_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<String, TrackerError> {
        // The tracker has no in-place update for activities; replace is
        // delete + create, which preserves the upsert semantics sinks need.
        let _ = self
            .graphql(
                r#"mutation($id: String!) { agentActivityDelete(id: $id) { success } }"#,
                json!({ "id": activity_id }),
            )
            .await?;
        self.post_activity(agent_session_id, activity).await
    }

    async fn upload_attachment(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, TrackerError> {
        // Two-step upload: request a signed URL, then PUT the payload.
        let reply = self
            .graphql(
                r#"mutation($contentType: String!, $filename: String!, $size: Int!) {
                     fileUpload(contentType: $contentType, filename: $filename, size: $size) {
                       uploadFile { uploadUrl assetUrl }
                     }
                   }"#,
                json!({
                    "contentType": content_type,
                    "filename": filename,
                    "size": data.len(),
                }),
            )
            .await?;
        let upload_url = reply
            .pointer("/fileUpload/uploadFile/uploadUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrackerError::Api("fileUpload returned no uploadUrl".into()))?;
        let asset_url = reply
            .pointer("/fileUpload/uploadFile/assetUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrackerError::Api("fileUpload returned no assetUrl".into()))?
            .to_string();

        let put = self
            .client
            .put(upload_url)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await?;
        if !put.status().is_success() {
            return Err(TrackerError::Status {
                status: put.status().as_u16(),
            });
        }
        Ok(asset_url)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
