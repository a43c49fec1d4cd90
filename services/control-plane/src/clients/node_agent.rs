//! Node-agent HTTP client.
//!
//! The node agent is the host-local service that actually creates and
//! destroys VMs. Its API is idempotent on `vm_id`: PUT creates-or-confirms,
//! DELETE of an unknown VM is a success. The agent also exposes
//! `GET /v1/capacity` and `GET /healthz`, which the control plane does not
//! consume (capacity arrives via heartbeats instead).
//!
//! Calls per host are limited to a small concurrency to protect the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Concurrent in-flight requests allowed per host.
const PER_HOST_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("node agent request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node agent returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
}

impl AgentError {
    /// Short classification used in event payloads and `last_error`.
    pub fn error_type(&self) -> String {
        match self {
            AgentError::Transport(e) if e.is_timeout() => "timeout".to_string(),
            AgentError::Transport(e) if e.is_connect() => "connect".to_string(),
            AgentError::Transport(_) => "transport".to_string(),
            AgentError::Status { status, .. } => format!("http_{status}"),
        }
    }
}

/// Body of `PUT /v1/vms/{vm_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct VmLaunchSpec {
    pub label: String,
    pub base_image_id: String,
    pub vcpu: i64,
    pub ram_mb: i64,
    pub disk_gb: i64,
    pub ttl_deadline: String,
    pub connect_deadline: String,
    pub controller_url: String,
    pub controller_node_name: String,
    pub inbound_secret: String,
    pub cloud_init_user_data_b64: String,
}

/// One VM in the agent's inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub vm_id: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Deserialize)]
struct VmListResponse {
    #[serde(default)]
    items: Vec<VmInfo>,
}

/// Node-agent operations the control loops depend on.
#[async_trait]
pub trait NodeAgentApi: Send + Sync {
    /// Create or confirm a VM. 2xx means the VM exists (or is booting).
    async fn ensure_vm(
        &self,
        base_url: &str,
        vm_id: &str,
        spec: &VmLaunchSpec,
    ) -> Result<(), AgentError>;

    /// Destroy a VM. Unknown `vm_id` is a success (idempotent teardown).
    async fn delete_vm(&self, base_url: &str, vm_id: &str, reason: &str)
        -> Result<(), AgentError>;

    /// The agent's full VM inventory.
    async fn list_vms(&self, base_url: &str) -> Result<Vec<VmInfo>, AgentError>;
}

/// reqwest-backed implementation of [`NodeAgentApi`].
pub struct HttpNodeAgent {
    client: reqwest::Client,
    auth_token: Option<String>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpNodeAgent {
    pub fn new(timeout: Duration, auth_token: Option<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            auth_token,
            limits: Mutex::new(HashMap::new()),
        })
    }

    fn limiter(&self, base_url: &str) -> Arc<Semaphore> {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        limits
            .entry(base_url.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_CONCURRENCY)))
            .clone()
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(AgentError::Status {
            status: status.as_u16(),
            detail: detail.chars().take(240).collect(),
        })
    }
}

#[async_trait]
impl NodeAgentApi for HttpNodeAgent {
    async fn ensure_vm(
        &self,
        base_url: &str,
        vm_id: &str,
        spec: &VmLaunchSpec,
    ) -> Result<(), AgentError> {
        let limiter = self.limiter(base_url);
        let _permit = limiter.acquire().await;
        let url = format!("{}/v1/vms/{vm_id}", base_url.trim_end_matches('/'));
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(spec)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_vm(
        &self,
        base_url: &str,
        vm_id: &str,
        reason: &str,
    ) -> Result<(), AgentError> {
        let limiter = self.limiter(base_url);
        let _permit = limiter.acquire().await;
        let url = format!(
            "{}/v1/vms/{vm_id}?reason={}",
            base_url.trim_end_matches('/'),
            reason
        );
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        self.check(response).await?;
        Ok(())
    }

    async fn list_vms(&self, base_url: &str) -> Result<Vec<VmInfo>, AgentError> {
        let limiter = self.limiter(base_url);
        let _permit = limiter.acquire().await;
        let url = format!("{}/v1/vms", base_url.trim_end_matches('/'));
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let body: VmListResponse = self.check(response).await?.json().await?;
        Ok(body.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_serializes_wire_fields() {
        let spec = VmLaunchSpec {
            label: "linux".into(),
            base_image_id: "default".into(),
            vcpu: 2,
            ram_mb: 4096,
            disk_gb: 40,
            ttl_deadline: "2026-01-01T00:00:00Z".into(),
            connect_deadline: "2026-01-01T00:04:00Z".into(),
            controller_url: "http://jenkins:8080".into(),
            controller_node_name: "ephemeral-abc".into(),
            inbound_secret: "s3cret".into(),
            cloud_init_user_data_b64: "I2Nsb3VkLWNvbmZpZw==".into(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        for field in [
            "label",
            "base_image_id",
            "vcpu",
            "ram_mb",
            "disk_gb",
            "ttl_deadline",
            "connect_deadline",
            "controller_url",
            "controller_node_name",
            "inbound_secret",
            "cloud_init_user_data_b64",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn vm_list_parses_items() {
        let raw = r#"{"items":[{"vm_id":"vm-1","state":"RUNNING"},{"vm_id":"vm-2"}]}"#;
        let parsed: VmListResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].vm_id, "vm-1");
        assert_eq!(parsed.items[1].state, "");
    }
}
