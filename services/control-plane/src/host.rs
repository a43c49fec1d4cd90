//! Host model.
//!
//! A host is a bare-metal machine running a node agent. Rows are created by
//! operator provisioning (or, behind a dev flag, by first registration) and
//! mutated by registration, heartbeats, and operator enable/disable.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::lease::NodeProfile;

/// Platform identity a host advertises at registration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Platform {
    pub os_family: Option<String>,
    pub os_flavor: Option<String>,
    pub os_version: Option<String>,
    pub cpu_arch: Option<String>,
    pub selected_accel: Option<String>,
    pub supported_accels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub host_id: String,
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub bootstrap_token_hash: Option<String>,
    #[serde(skip_serializing)]
    pub session_token_hash: Option<String>,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub agent_url: Option<String>,
    #[serde(flatten)]
    pub platform: Platform,
    /// Labels this host serves. Empty means it serves every label.
    pub labels: Vec<String>,
    pub cpu_total: i64,
    pub cpu_free: i64,
    pub ram_total_mb: i64,
    pub ram_free_mb: i64,
    pub io_pressure: f64,
    /// VM inventory the agent declared in its latest heartbeat.
    pub active_vm_ids: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Host {
    /// A host can take new placements iff it is enabled, recently seen,
    /// advertises a coherent accelerator selection, and has at least one
    /// free CPU.
    pub fn is_schedulable(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        let fresh = match self.last_seen {
            Some(seen) => now - seen <= stale_after,
            None => false,
        };
        fresh && self.accel_coherent() && self.cpu_free >= 1
    }

    /// True when the selected accelerator (if any) is among the supported
    /// ones. Hosts that advertise no accelerator are acceptable.
    pub fn accel_coherent(&self) -> bool {
        match &self.platform.selected_accel {
            Some(accel) => self.platform.supported_accels.iter().any(|a| a == accel),
            None => true,
        }
    }

    /// Whether this host serves jobs carrying `label`.
    pub fn serves_label(&self, label: &str) -> bool {
        self.labels.is_empty() || self.labels.iter().any(|l| l == label)
    }

    /// Whether the host's last declared capacity fits `demand`.
    pub fn fits(&self, demand: &NodeProfile) -> bool {
        self.cpu_free >= demand.vcpu && self.ram_free_mb >= demand.ram_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::PROFILE_SMALL;

    fn host(last_seen_secs_ago: i64) -> Host {
        let now = Utc::now();
        Host {
            host_id: "h1".into(),
            enabled: true,
            bootstrap_token_hash: None,
            session_token_hash: None,
            session_expires_at: None,
            agent_url: Some("http://localhost:9000".into()),
            platform: Platform::default(),
            labels: vec![],
            cpu_total: 8,
            cpu_free: 8,
            ram_total_mb: 16384,
            ram_free_mb: 16384,
            io_pressure: 0.0,
            active_vm_ids: vec![],
            last_seen: Some(now - Duration::seconds(last_seen_secs_ago)),
        }
    }

    #[test]
    fn fresh_enabled_host_is_schedulable() {
        let h = host(5);
        assert!(h.is_schedulable(Utc::now(), Duration::seconds(20)));
        assert!(h.fits(&PROFILE_SMALL));
    }

    #[test]
    fn stale_host_is_not_schedulable() {
        let h = host(60);
        assert!(!h.is_schedulable(Utc::now(), Duration::seconds(20)));
    }

    #[test]
    fn disabled_host_is_not_schedulable() {
        let mut h = host(5);
        h.enabled = false;
        assert!(!h.is_schedulable(Utc::now(), Duration::seconds(20)));
    }

    #[test]
    fn never_seen_host_is_not_schedulable() {
        let mut h = host(0);
        h.last_seen = None;
        assert!(!h.is_schedulable(Utc::now(), Duration::seconds(20)));
    }

    #[test]
    fn incoherent_accel_blocks_scheduling() {
        let mut h = host(5);
        h.platform.selected_accel = Some("kvm".into());
        h.platform.supported_accels = vec!["tcg".into()];
        assert!(!h.is_schedulable(Utc::now(), Duration::seconds(20)));
        h.platform.supported_accels.push("kvm".into());
        assert!(h.is_schedulable(Utc::now(), Duration::seconds(20)));
    }

    #[test]
    fn label_matching_defaults_to_serve_all() {
        let mut h = host(5);
        assert!(h.serves_label("anything"));
        h.labels = vec!["linux".into()];
        assert!(h.serves_label("linux"));
        assert!(!h.serves_label("windows"));
    }
}
