//! Job-controller adapter.
//!
//! The external controller (Jenkins) owns the job queue and the node
//! objects our ephemeral VMs connect back to. The control plane only needs
//! five operations from it; [`ControllerAdapter`] captures them, and
//! [`JenkinsController`] implements them against the Jenkins REST API.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("controller returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("could not parse controller response: {0}")]
    Parse(String),
}

impl ControllerError {
    /// Short classification used in event payloads and `last_error`.
    pub fn error_type(&self) -> String {
        match self {
            ControllerError::Transport(e) if e.is_timeout() => "timeout".to_string(),
            ControllerError::Transport(e) if e.is_connect() => "connect".to_string(),
            ControllerError::Transport(_) => "transport".to_string(),
            ControllerError::Status { status, .. } => format!("http_{status}"),
            ControllerError::Parse(_) => "parse".to_string(),
        }
    }
}

/// Liveness of a controller-side node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerNodeState {
    pub online: bool,
    pub busy: bool,
}

/// The five controller operations the core depends on.
///
/// `node_state` distinguishes "definitively absent" (`Ok(None)`) from "no
/// information" (`Err`): the reconciler must never treat a failed query as
/// absence.
#[async_trait]
pub trait ControllerAdapter: Send + Sync {
    /// Queued job counts per label.
    async fn queue_snapshot(&self) -> Result<HashMap<String, i64>, ControllerError>;

    /// Queued job count for one label.
    async fn queued(&self, label: &str) -> Result<i64, ControllerError> {
        Ok(self
            .queue_snapshot()
            .await?
            .get(label)
            .copied()
            .unwrap_or(0))
    }

    /// Create an exclusive single-executor node and return its inbound
    /// secret. Idempotent on the node name.
    async fn create_node(&self, name: &str, label: &str) -> Result<String, ControllerError>;

    /// Delete a node. Deleting a node that does not exist is a success.
    async fn delete_node(&self, name: &str) -> Result<(), ControllerError>;

    /// State of a node, or `None` if the controller says it does not exist.
    async fn node_state(&self, name: &str)
        -> Result<Option<ControllerNodeState>, ControllerError>;

    /// Names of all nodes starting with `prefix`.
    async fn list_nodes_with_prefix(&self, prefix: &str)
        -> Result<Vec<String>, ControllerError>;
}

/// Jenkins implementation of [`ControllerAdapter`].
pub struct JenkinsController {
    base_url: String,
    user: String,
    api_token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct QueueResponse {
    #[serde(default)]
    items: Vec<QueueItem>,
}

#[derive(Deserialize)]
struct QueueItem {
    #[serde(rename = "assignedLabel")]
    assigned_label: Option<AssignedLabel>,
}

#[derive(Deserialize)]
struct AssignedLabel {
    name: Option<String>,
}

#[derive(Deserialize)]
struct ComputerResponse {
    #[serde(default)]
    computer: Vec<ComputerItem>,
}

#[derive(Deserialize)]
struct ComputerItem {
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Deserialize)]
struct NodeApiResponse {
    #[serde(default)]
    offline: bool,
    #[serde(default)]
    idle: bool,
}

impl JenkinsController {
    pub fn new(
        base_url: &str,
        user: &str,
        api_token: &str,
        timeout: Duration,
    ) -> Result<Self, ControllerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            api_token: api_token.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ControllerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(ControllerError::Status {
            status: status.as_u16(),
            detail: detail.chars().take(240).collect(),
        })
    }
}

#[async_trait]
impl ControllerAdapter for JenkinsController {
    async fn queue_snapshot(&self) -> Result<HashMap<String, i64>, ControllerError> {
        let response = self
            .client
            .get(self.url("/queue/api/json"))
            .basic_auth(&self.user, Some(&self.api_token))
            .send()
            .await?;
        let body: QueueResponse = self.check(response).await?.json().await?;

        let mut queued_by_label = HashMap::new();
        for item in body.items {
            if let Some(name) = item.assigned_label.and_then(|l| l.name) {
                *queued_by_label.entry(name).or_insert(0) += 1;
            }
        }
        Ok(queued_by_label)
    }

    async fn create_node(&self, name: &str, label: &str) -> Result<String, ControllerError> {
        let node_definition = serde_json::json!({
            "name": name,
            "nodeDescription": "ephemeral vm node",
            "numExecutors": "1",
            "remoteFS": "/home/agent",
            "labelString": label,
            "mode": "EXCLUSIVE",
            "launcher": {
                "stapler-class": "hudson.slaves.JNLPLauncher",
                "$class": "hudson.slaves.JNLPLauncher",
            },
            "retentionStrategy": {
                "stapler-class": "hudson.slaves.RetentionStrategy$Always",
                "$class": "hudson.slaves.RetentionStrategy$Always",
            },
            "nodeProperties": { "stapler-class-bag": "true" },
        });
        let response = self
            .client
            .post(self.url("/computer/doCreateItem"))
            .basic_auth(&self.user, Some(&self.api_token))
            .form(&[
                ("name", name),
                ("type", "hudson.slaves.DumbSlave$DescriptorImpl"),
                ("json", &node_definition.to_string()),
            ])
            .send()
            .await?;
        self.check(response).await?;

        // The inbound secret is only exposed through the JNLP document.
        let response = self
            .client
            .get(self.url(&format!("/computer/{name}/slave-agent.jnlp")))
            .basic_auth(&self.user, Some(&self.api_token))
            .send()
            .await?;
        let text = self.check(response).await?.text().await?;
        parse_inbound_secret(&text)
            .ok_or_else(|| ControllerError::Parse(format!("no inbound secret for node {name}")))
    }

    async fn delete_node(&self, name: &str) -> Result<(), ControllerError> {
        let response = self
            .client
            .post(self.url(&format!("/computer/{name}/doDelete")))
            .basic_auth(&self.user, Some(&self.api_token))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        self.check(response).await?;
        Ok(())
    }

    async fn node_state(
        &self,
        name: &str,
    ) -> Result<Option<ControllerNodeState>, ControllerError> {
        let response = self
            .client
            .get(self.url(&format!("/computer/{name}/api/json")))
            .basic_auth(&self.user, Some(&self.api_token))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let body: NodeApiResponse = self.check(response).await?.json().await?;
        Ok(Some(ControllerNodeState {
            online: !body.offline,
            busy: !body.idle,
        }))
    }

    async fn list_nodes_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, ControllerError> {
        let response = self
            .client
            .get(self.url("/computer/api/json"))
            .basic_auth(&self.user, Some(&self.api_token))
            .send()
            .await?;
        let body: ComputerResponse = self.check(response).await?.json().await?;
        Ok(body
            .computer
            .into_iter()
            .map(|c| c.display_name)
            .filter(|name| name.starts_with(prefix))
            .collect())
    }
}

/// Pull the first `<argument>` out of a JNLP document; Jenkins puts the
/// inbound secret there.
fn parse_inbound_secret(jnlp: &str) -> Option<String> {
    let start = jnlp.find("<argument>")? + "<argument>".len();
    let end = jnlp[start..].find("</argument>")? + start;
    Some(jnlp[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_secret_is_first_argument() {
        let jnlp = "<jnlp><application-desc>\
                    <argument>deadbeef</argument><argument>node-1</argument>\
                    </application-desc></jnlp>";
        assert_eq!(parse_inbound_secret(jnlp).as_deref(), Some("deadbeef"));
        assert_eq!(parse_inbound_secret("<jnlp></jnlp>"), None);
    }

    #[test]
    fn queue_response_tolerates_missing_labels() {
        let raw = r#"{"items":[
            {"assignedLabel":{"name":"linux"}},
            {"assignedLabel":{}},
            {}
        ]}"#;
        let parsed: QueueResponse = serde_json::from_str(raw).unwrap();
        let labelled: Vec<_> = parsed
            .items
            .into_iter()
            .filter_map(|i| i.assigned_label.and_then(|l| l.name))
            .collect();
        assert_eq!(labelled, vec!["linux"]);
    }

    #[test]
    fn error_type_classifies_status() {
        let e = ControllerError::Status {
            status: 503,
            detail: "busy".into(),
        };
        assert_eq!(e.error_type(), "http_503");
    }
}
