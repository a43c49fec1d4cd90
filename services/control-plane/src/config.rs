//! Configuration for the control plane.
//!
//! Everything is environment-driven with defaults suitable for local
//! development. Loop cadence, admission caps, and deadlines are the knobs
//! operators actually tune; the rest rarely changes.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// SQLite database URL.
    pub database_url: String,

    /// Base URL of the job controller.
    pub controller_url: String,
    pub controller_user: String,
    pub controller_api_token: String,

    /// Optional bearer token presented to node agents.
    pub node_agent_auth_token: Option<String>,

    /// Scaler + reconciler cadence.
    pub loop_interval: Duration,

    /// Garbage collector cadence.
    pub gc_interval: Duration,

    /// Hard cap on non-terminal leases across all labels.
    pub global_max_vms: i64,

    /// Hard cap on PROVISIONING/BOOTING/CONNECTING leases per label.
    pub label_max_inflight: i64,

    /// Max launches for one label in a single scaler tick.
    pub label_burst: i64,

    /// Seconds a new VM has to connect back to the controller.
    pub connect_deadline_sec: u64,

    /// Seconds a RUNNING lease may stay disconnected before teardown.
    pub disconnected_grace_sec: u64,

    /// Absolute lifetime bound for any lease.
    pub vm_ttl_sec: u64,

    /// A host is unschedulable once its last heartbeat is older than this.
    pub host_stale_timeout_sec: u64,

    /// Interval node agents are told to heartbeat at.
    pub heartbeat_interval_sec: u64,

    /// How long a BOOTING lease may go unseen in the agent inventory
    /// before the reconciler fails it.
    pub boot_grace_sec: u64,

    /// Per-label pause after a tick that launched something.
    pub cooldown_sec: u64,

    /// Consecutive teardown failures tolerated before a lease is left for
    /// operator attention.
    pub retry_budget: u32,

    /// Timeout applied to every outbound RPC.
    pub rpc_timeout: Duration,

    /// Number of event rows to retain.
    pub event_retention: i64,

    /// Name prefix identifying our ephemeral controller nodes.
    pub node_name_prefix: String,

    /// Image handed to node agents for new VMs.
    pub base_image_id: String,

    pub disable_background_loops: bool,
    pub allow_unknown_host_registration: bool,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_string("LISTEN_ADDR", "127.0.0.1:8080").parse()?;
        Ok(Self {
            listen_addr,
            database_url: env_string("DATABASE_URL", "sqlite://control_plane.db"),
            controller_url: env_string("JENKINS_URL", "http://localhost:8080"),
            controller_user: env_string("JENKINS_USER", "admin"),
            controller_api_token: env_string("JENKINS_API_TOKEN", "admin"),
            node_agent_auth_token: std::env::var("NODE_AGENT_AUTH_TOKEN").ok(),
            loop_interval: Duration::from_secs(env_parse("LOOP_INTERVAL_SEC", 5)),
            gc_interval: Duration::from_secs(env_parse("GC_INTERVAL_SEC", 5)),
            global_max_vms: env_parse("GLOBAL_MAX_VMS", 100),
            label_max_inflight: env_parse("LABEL_MAX_INFLIGHT", 5),
            label_burst: env_parse("LABEL_BURST", 3),
            connect_deadline_sec: env_parse("CONNECT_DEADLINE_SEC", 240),
            disconnected_grace_sec: env_parse("DISCONNECTED_GRACE_SEC", 60),
            vm_ttl_sec: env_parse("VM_TTL_SEC", 7200),
            host_stale_timeout_sec: env_parse("HOST_STALE_TIMEOUT_SEC", 20),
            heartbeat_interval_sec: env_parse("HEARTBEAT_INTERVAL_SEC", 10),
            boot_grace_sec: env_parse("BOOT_GRACE_SEC", 120),
            cooldown_sec: env_parse("COOLDOWN_SEC", 15),
            retry_budget: env_parse("RETRY_BUDGET", 20),
            rpc_timeout: Duration::from_secs(env_parse("RPC_TIMEOUT_SEC", 10)),
            event_retention: env_parse("EVENT_RETENTION", 10_000),
            node_name_prefix: env_string("NODE_NAME_PREFIX", "ephemeral-"),
            base_image_id: env_string("BASE_IMAGE_ID", "default"),
            disable_background_loops: env_bool("DISABLE_BACKGROUND_LOOPS"),
            allow_unknown_host_registration: env_bool("ALLOW_UNKNOWN_HOST_REGISTRATION"),
        })
    }

    pub fn host_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.host_stale_timeout_sec as i64)
    }

    pub fn boot_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.boot_grace_sec as i64)
    }

    pub fn disconnected_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.disconnected_grace_sec as i64)
    }

    /// Defaults used by tests and as the base for `from_env`.
    pub fn for_testing() -> Self {
        Self {
            listen_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url: "sqlite::memory:".to_string(),
            controller_url: "http://localhost:8080".to_string(),
            controller_user: "admin".to_string(),
            controller_api_token: "admin".to_string(),
            node_agent_auth_token: None,
            loop_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(5),
            global_max_vms: 100,
            label_max_inflight: 5,
            label_burst: 3,
            connect_deadline_sec: 240,
            disconnected_grace_sec: 60,
            vm_ttl_sec: 7200,
            host_stale_timeout_sec: 20,
            heartbeat_interval_sec: 10,
            boot_grace_sec: 120,
            cooldown_sec: 15,
            retry_budget: 20,
            rpc_timeout: Duration::from_secs(10),
            event_retention: 10_000,
            node_name_prefix: "ephemeral-".to_string(),
            base_image_id: "default".to_string(),
            disable_background_loops: true,
            allow_unknown_host_registration: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_defaults_match_spec() {
        let config = Config::for_testing();
        assert_eq!(config.loop_interval.as_secs(), 5);
        assert_eq!(config.gc_interval.as_secs(), 5);
        assert_eq!(config.label_max_inflight, 5);
        assert_eq!(config.label_burst, 3);
        assert_eq!(config.connect_deadline_sec, 240);
        assert_eq!(config.disconnected_grace_sec, 60);
        assert_eq!(config.retry_budget, 20);
        assert!(!config.allow_unknown_host_registration);
    }
}
