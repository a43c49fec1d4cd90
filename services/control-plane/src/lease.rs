//! Lease model and state machine.
//!
//! A lease is the authoritative record tying one queued controller job to
//! one VM and one controller node. Every lifecycle change is a
//! compare-and-swap on the current state; the transition table below is the
//! single source of truth for which moves are legal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a lease.
///
/// TERMINATED and FAILED are terminal. Any live state may move forward to
/// TERMINATING (deadline enforcement, manual terminate); nothing ever moves
/// backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    Requested,
    Provisioning,
    Booting,
    Connecting,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Requested => "REQUESTED",
            LeaseState::Provisioning => "PROVISIONING",
            LeaseState::Booting => "BOOTING",
            LeaseState::Connecting => "CONNECTING",
            LeaseState::Running => "RUNNING",
            LeaseState::Terminating => "TERMINATING",
            LeaseState::Terminated => "TERMINATED",
            LeaseState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUESTED" => Some(LeaseState::Requested),
            "PROVISIONING" => Some(LeaseState::Provisioning),
            "BOOTING" => Some(LeaseState::Booting),
            "CONNECTING" => Some(LeaseState::Connecting),
            "RUNNING" => Some(LeaseState::Running),
            "TERMINATING" => Some(LeaseState::Terminating),
            "TERMINATED" => Some(LeaseState::Terminated),
            "FAILED" => Some(LeaseState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseState::Terminated | LeaseState::Failed)
    }

    /// States that count against `LABEL_MAX_INFLIGHT`.
    pub fn is_inflight(&self) -> bool {
        matches!(
            self,
            LeaseState::Provisioning | LeaseState::Booting | LeaseState::Connecting
        )
    }

    pub const ALL: [LeaseState; 8] = [
        LeaseState::Requested,
        LeaseState::Provisioning,
        LeaseState::Booting,
        LeaseState::Connecting,
        LeaseState::Running,
        LeaseState::Terminating,
        LeaseState::Terminated,
        LeaseState::Failed,
    ];
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal forward transitions. A transition to the same state is a no-op
/// and always allowed (idempotent retries).
pub fn can_transition(from: LeaseState, to: LeaseState) -> bool {
    use LeaseState::*;
    if from == to {
        return true;
    }
    match from {
        Requested => matches!(to, Provisioning | Terminating | Failed),
        Provisioning => matches!(to, Booting | Terminating | Failed),
        Booting => matches!(to, Connecting | Terminating | Failed),
        Connecting => matches!(to, Running | Terminating | Failed),
        Running => matches!(to, Terminating | Failed),
        Terminating => matches!(to, Terminated),
        Terminated | Failed => false,
    }
}

/// Resource shape of the VM a lease will get, derived from its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeProfile {
    pub vcpu: i64,
    pub ram_mb: i64,
    pub disk_gb: i64,
}

pub const PROFILE_SMALL: NodeProfile = NodeProfile {
    vcpu: 2,
    ram_mb: 4096,
    disk_gb: 40,
};
pub const PROFILE_MEDIUM: NodeProfile = NodeProfile {
    vcpu: 4,
    ram_mb: 8192,
    disk_gb: 80,
};
pub const PROFILE_LARGE: NodeProfile = NodeProfile {
    vcpu: 8,
    ram_mb: 16384,
    disk_gb: 120,
};

/// Pick a VM profile for a controller label. Labels opt into bigger VMs by
/// mentioning `medium` or `large`; everything else gets the small profile.
pub fn profile_for_label(label: &str) -> NodeProfile {
    if label.contains("large") {
        PROFILE_LARGE
    } else if label.contains("medium") {
        PROFILE_MEDIUM
    } else {
        PROFILE_SMALL
    }
}

/// Normalize a controller label expression into a plain token list suitable
/// for node creation. Boolean operators are dropped, duplicates removed.
pub fn normalize_node_label(label: &str) -> String {
    let mut cleaned: Vec<&str> = Vec::new();
    for token in label.split(|c: char| !(c.is_ascii_alphanumeric() || "_.:-".contains(c))) {
        if token.is_empty() {
            continue;
        }
        let lowered = token.to_ascii_lowercase();
        if matches!(lowered.as_str(), "and" | "or" | "not" | "true" | "false") {
            continue;
        }
        if !cleaned.contains(&token) {
            cleaned.push(token);
        }
    }
    if cleaned.is_empty() {
        "ephemeral".to_string()
    } else {
        cleaned.join(" ")
    }
}

/// The canonical lease record as persisted in the store.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub lease_id: String,
    pub vm_id: String,
    pub label: String,
    pub controller_node_name: String,
    pub state: LeaseState,
    pub host_id: Option<String>,
    pub cpu_reserved: i64,
    pub ram_reserved_mb: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connect_deadline: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Lease {
    /// Create a fresh REQUESTED lease for a label. The `vm_id` is chosen
    /// here, before any external call, and serves as the idempotency key
    /// for every node-agent interaction that follows.
    pub fn new_requested(
        label: &str,
        node_name_prefix: &str,
        connect_deadline_sec: u64,
        vm_ttl_sec: u64,
    ) -> Self {
        let now = Utc::now();
        let lease_id = Uuid::new_v4().simple().to_string();
        let short = &lease_id[..12];
        let profile = profile_for_label(label);
        Lease {
            vm_id: format!("vm-{short}"),
            controller_node_name: format!("{node_name_prefix}{short}"),
            lease_id,
            label: label.to_string(),
            state: LeaseState::Requested,
            host_id: None,
            cpu_reserved: profile.vcpu,
            ram_reserved_mb: profile.ram_mb,
            created_at: now,
            updated_at: now,
            connect_deadline: now + Duration::seconds(connect_deadline_sec as i64),
            ttl_deadline: now + Duration::seconds(vm_ttl_sec as i64),
            last_heartbeat: None,
            last_error: None,
        }
    }

    pub fn profile(&self) -> NodeProfile {
        profile_for_label(&self.label)
    }
}
