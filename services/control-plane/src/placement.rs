//! Host selection for new leases.
//!
//! Placement filters to schedulable hosts that serve the label, scores
//! candidates (least IO pressure first, then most free RAM, then most free
//! CPU), and breaks ties by host id so decisions are deterministic. A
//! short-lived in-memory reservation per pick stops one scaler tick from
//! stacking every launch onto the host whose heartbeat has not caught up
//! yet; reservations are advisory and decay on their own.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::host::Host;
use crate::lease::NodeProfile;

/// How long an advisory reservation shadows a host's declared capacity.
/// Two heartbeat intervals is enough for the agent to report the new VM.
const RESERVATION_TTL_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlacementRejection {
    #[error("NO_HOSTS_ENABLED")]
    NoHostsEnabled,

    #[error("LABEL_NOT_SERVED")]
    LabelNotServed,

    #[error("INSUFFICIENT_CAPACITY")]
    InsufficientCapacity,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    expires: DateTime<Utc>,
    vcpu: i64,
    ram_mb: i64,
}

#[derive(Default)]
pub struct Placement {
    reservations: Mutex<HashMap<String, Vec<Reservation>>>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose a host for a lease with the given label and demand.
    pub fn pick(
        &self,
        hosts: &[Host],
        label: &str,
        demand: &NodeProfile,
        stale_after: Duration,
    ) -> Result<String, PlacementRejection> {
        let now = Utc::now();
        if !hosts.iter().any(|h| h.enabled) {
            return Err(PlacementRejection::NoHostsEnabled);
        }
        let serving: Vec<&Host> = hosts
            .iter()
            .filter(|h| h.enabled && h.serves_label(label))
            .collect();
        if serving.is_empty() {
            return Err(PlacementRejection::LabelNotServed);
        }

        let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        for slots in reservations.values_mut() {
            slots.retain(|r| r.expires > now);
        }

        let mut candidates: Vec<&Host> = serving
            .into_iter()
            .filter(|h| {
                let (res_cpu, res_ram) = reservations
                    .get(&h.host_id)
                    .map(|slots| {
                        slots
                            .iter()
                            .fold((0, 0), |(c, r), s| (c + s.vcpu, r + s.ram_mb))
                    })
                    .unwrap_or((0, 0));
                h.is_schedulable(now, stale_after)
                    && h.cpu_free - res_cpu >= demand.vcpu
                    && h.ram_free_mb - res_ram >= demand.ram_mb
            })
            .collect();
        if candidates.is_empty() {
            return Err(PlacementRejection::InsufficientCapacity);
        }

        candidates.sort_by(|a, b| {
            a.io_pressure
                .partial_cmp(&b.io_pressure)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.ram_free_mb.cmp(&a.ram_free_mb))
                .then(b.cpu_free.cmp(&a.cpu_free))
                .then(a.host_id.cmp(&b.host_id))
        });

        let chosen = candidates[0].host_id.clone();
        reservations.entry(chosen.clone()).or_default().push(Reservation {
            expires: now + Duration::seconds(RESERVATION_TTL_SECS),
            vcpu: demand.vcpu,
            ram_mb: demand.ram_mb,
        });
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Platform;
    use crate::lease::{PROFILE_LARGE, PROFILE_SMALL};

    fn host(id: &str, cpu_free: i64, ram_free_mb: i64, io: f64) -> Host {
        Host {
            host_id: id.to_string(),
            enabled: true,
            bootstrap_token_hash: None,
            session_token_hash: None,
            session_expires_at: None,
            agent_url: Some(format!("http://{id}:9000")),
            platform: Platform::default(),
            labels: vec![],
            cpu_total: cpu_free,
            cpu_free,
            ram_total_mb: ram_free_mb,
            ram_free_mb,
            io_pressure: io,
            active_vm_ids: vec![],
            last_seen: Some(Utc::now()),
        }
    }

    fn stale() -> Duration {
        Duration::seconds(20)
    }

    #[test]
    fn rejects_when_no_hosts_enabled() {
        let mut h = host("h1", 8, 8192, 0.0);
        h.enabled = false;
        let placement = Placement::new();
        assert_eq!(
            placement.pick(&[h], "linux", &PROFILE_SMALL, stale()),
            Err(PlacementRejection::NoHostsEnabled)
        );
    }

    #[test]
    fn rejects_unserved_label() {
        let mut h = host("h1", 8, 8192, 0.0);
        h.labels = vec!["windows".into()];
        let placement = Placement::new();
        assert_eq!(
            placement.pick(&[h], "linux", &PROFILE_SMALL, stale()),
            Err(PlacementRejection::LabelNotServed)
        );
    }

    #[test]
    fn rejects_when_capacity_exhausted() {
        let h = host("h1", 1, 512, 0.0);
        let placement = Placement::new();
        assert_eq!(
            placement.pick(&[h], "linux", &PROFILE_SMALL, stale()),
            Err(PlacementRejection::InsufficientCapacity)
        );
    }

    #[test]
    fn prefers_low_io_pressure_then_free_ram() {
        let placement = Placement::new();
        let hosts = vec![
            host("busy", 16, 32768, 0.9),
            host("calm-small", 8, 8192, 0.1),
            host("calm-big", 8, 16384, 0.1),
        ];
        let picked = placement
            .pick(&hosts, "linux", &PROFILE_SMALL, stale())
            .unwrap();
        assert_eq!(picked, "calm-big");
    }

    #[test]
    fn ties_break_by_host_id() {
        let placement = Placement::new();
        let hosts = vec![host("b", 8, 8192, 0.0), host("a", 8, 8192, 0.0)];
        let picked = placement
            .pick(&hosts, "linux", &PROFILE_SMALL, stale())
            .unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn reservations_spread_consecutive_picks() {
        let placement = Placement::new();
        // One large host: each large pick shadows 8 cpu / 16 GB, so the
        // second pick in the same tick must fail rather than overcommit.
        let hosts = vec![host("h1", 8, 16384, 0.0)];
        assert!(placement
            .pick(&hosts, "large", &PROFILE_LARGE, stale())
            .is_ok());
        assert_eq!(
            placement.pick(&hosts, "large", &PROFILE_LARGE, stale()),
            Err(PlacementRejection::InsufficientCapacity)
        );
    }
}
