//! Provisioner: drives one lease from REQUESTED to BOOTING.
//!
//! The sequence is CAS-first so a crashed or duplicate attempt can never
//! double-launch: only the caller whose REQUESTED->PROVISIONING swap lands
//! proceeds to side effects. On any failure the controller node is deleted
//! best-effort (idempotent) and the lease moves to FAILED with the error
//! recorded; no VM outlives a failed attempt except transiently, where the
//! reconciler picks it up as an orphan.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use crate::clients::{AgentError, ControllerAdapter, ControllerError, NodeAgentApi, VmLaunchSpec};
use crate::config::Config;
use crate::db::{Database, DbError};
use crate::host::Host;
use crate::lease::{normalize_node_label, Lease, LeaseState};
use crate::metrics::LAUNCH_ATTEMPTS_TOTAL;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Another loop moved the lease first; nothing was done.
    #[error("lease {0} is no longer REQUESTED")]
    Superseded(String),

    #[error("host {0} has not registered an agent URL")]
    NoAgentUrl(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("controller node allocation failed: {0}")]
    Controller(#[source] ControllerError),

    #[error("node agent launch failed: {0}")]
    Agent(#[source] AgentError),
}

pub struct Provisioner {
    db: Database,
    controller: Arc<dyn ControllerAdapter>,
    agents: Arc<dyn NodeAgentApi>,
    config: Arc<Config>,
}

impl Provisioner {
    pub fn new(
        db: Database,
        controller: Arc<dyn ControllerAdapter>,
        agents: Arc<dyn NodeAgentApi>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            controller,
            agents,
            config,
        }
    }

    /// Take a REQUESTED lease through node allocation and VM launch.
    pub async fn provision(&self, lease: &Lease, host: &Host) -> Result<(), ProvisionError> {
        let leases = self.db.leases();
        let agent_url = host
            .agent_url
            .clone()
            .ok_or_else(|| ProvisionError::NoAgentUrl(host.host_id.clone()))?;

        let placed = leases
            .place(
                &lease.lease_id,
                &host.host_id,
                serde_json::json!({ "host_id": host.host_id, "node_agent_url": agent_url }),
            )
            .await?;
        if !placed {
            return Err(ProvisionError::Superseded(lease.lease_id.clone()));
        }
        counter!(LAUNCH_ATTEMPTS_TOTAL).increment(1);

        let node_label = normalize_node_label(&lease.label);
        let secret = match self
            .controller
            .create_node(&lease.controller_node_name, &node_label)
            .await
        {
            Ok(secret) => secret,
            Err(e) => {
                self.unwind(lease, host, None, e.error_type(), e.to_string())
                    .await?;
                return Err(ProvisionError::Controller(e));
            }
        };

        let spec = self.launch_spec(lease, &secret);
        if let Err(e) = self.agents.ensure_vm(&agent_url, &lease.vm_id, &spec).await {
            self.unwind(lease, host, Some(&agent_url), e.error_type(), e.to_string())
                .await?;
            return Err(ProvisionError::Agent(e));
        }

        leases
            .transition(
                &lease.lease_id,
                LeaseState::Provisioning,
                LeaseState::Booting,
                "lease.booting",
                serde_json::json!({ "host_id": host.host_id, "node_agent_url": agent_url }),
                None,
            )
            .await?;
        info!(
            lease_id = %lease.lease_id,
            vm_id = %lease.vm_id,
            host_id = %host.host_id,
            label = %lease.label,
            "Lease booting"
        );
        Ok(())
    }

    /// Record a launch failure: delete the controller node if it was
    /// created, then fail the lease.
    async fn unwind(
        &self,
        lease: &Lease,
        host: &Host,
        agent_url: Option<&str>,
        error_type: String,
        error_detail: String,
    ) -> Result<(), DbError> {
        if let Err(e) = self.controller.delete_node(&lease.controller_node_name).await {
            warn!(
                lease_id = %lease.lease_id,
                node = %lease.controller_node_name,
                error = %e,
                "Failed to unwind controller node; reconciler will retry"
            );
        }
        self.db
            .leases()
            .transition(
                &lease.lease_id,
                LeaseState::Provisioning,
                LeaseState::Failed,
                "scale.launch_failed",
                serde_json::json!({
                    "host_id": host.host_id,
                    "node_agent_url": agent_url,
                    "error_type": error_type,
                    "error_detail": error_detail,
                }),
                Some(&format!("{error_type}: {error_detail}")),
            )
            .await?;
        Ok(())
    }

    fn launch_spec(&self, lease: &Lease, secret: &str) -> VmLaunchSpec {
        let profile = lease.profile();
        VmLaunchSpec {
            label: lease.label.clone(),
            base_image_id: self.config.base_image_id.clone(),
            vcpu: profile.vcpu,
            ram_mb: profile.ram_mb,
            disk_gb: profile.disk_gb,
            ttl_deadline: lease.ttl_deadline.to_rfc3339(),
            connect_deadline: lease.connect_deadline.to_rfc3339(),
            controller_url: self.config.controller_url.clone(),
            controller_node_name: lease.controller_node_name.clone(),
            inbound_secret: secret.to_string(),
            cloud_init_user_data_b64: STANDARD.encode(build_cloud_init(
                &self.config.controller_url,
                &lease.controller_node_name,
                secret,
            )),
        }
    }
}

fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// Render the cloud-config that makes a fresh guest connect back to the
/// controller as an inbound agent. Guest internals beyond this handshake
/// are the image's concern.
pub fn build_cloud_init(controller_url: &str, node_name: &str, inbound_secret: &str) -> String {
    let url = controller_url.trim_end_matches('/');
    format!(
        r#"#cloud-config
write_files:
  - path: /etc/ci-agent.env
    permissions: '0600'
    content: |
      CONTROLLER_URL={url_q}
      NODE_NAME={name_q}
      INBOUND_SECRET={secret_q}
  - path: /usr/local/bin/start-inbound-agent.sh
    permissions: '0755'
    content: |
      #!/usr/bin/env bash
      set -eu
      . /etc/ci-agent.env
      mkdir -p /opt/agent /home/agent
      curl -fsSL "$CONTROLLER_URL/jnlpJars/agent.jar" -o /opt/agent/agent.jar
      exec java -jar /opt/agent/agent.jar \
        -url "$CONTROLLER_URL" \
        -name "$NODE_NAME" \
        -secret "$INBOUND_SECRET" \
        -workDir /home/agent \
        >> /var/log/inbound-agent.log 2>&1
runcmd:
  - [ /usr/bin/env, bash, -c, "nohup /usr/local/bin/start-inbound-agent.sh >> /var/log/inbound-agent.log 2>&1 &" ]
"#,
        url_q = shell_single_quote(url),
        name_q = shell_single_quote(node_name),
        secret_q = shell_single_quote(inbound_secret),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_init_embeds_handshake() {
        let doc = build_cloud_init("http://jenkins:8080/", "ephemeral-abc", "s3cret");
        assert!(doc.starts_with("#cloud-config"));
        assert!(doc.contains("CONTROLLER_URL='http://jenkins:8080'"));
        assert!(doc.contains("NODE_NAME='ephemeral-abc'"));
        assert!(doc.contains("INBOUND_SECRET='s3cret'"));
    }

    #[test]
    fn single_quotes_survive_shell_quoting() {
        assert_eq!(shell_single_quote("a'b"), "'a'\"'\"'b'");
        assert_eq!(shell_single_quote("plain"), "'plain'");
    }
}
