//! Garbage collector: deadline enforcement and idempotent teardown.
//!
//! Each tick:
//! - leases past their connect deadline that never connected are sent to
//!   TERMINATING, as is anything past its absolute TTL
//! - every TERMINATING lease gets a teardown attempt: node-agent DELETE
//!   (unknown VM counts as deleted), then controller node delete (failure
//!   tolerated; the reconciler sweeps stale nodes), then the TERMINATED
//!   swap. Transient agent failures retry next tick up to `RETRY_BUDGET`
//!   consecutive misses, after which the lease is left in TERMINATING for
//!   operator attention, never marked TERMINATED without confirmation.
//! - stale hosts are flagged, the event log is pruned, and the per-state
//!   gauges refresh.

use chrono::Utc;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::clients::{ControllerAdapter, NodeAgentApi};
use crate::config::Config;
use crate::db::{Database, DbError};
use crate::lease::{Lease, LeaseState};
use crate::metrics::{
    set_lease_gauges, HOST_STALE_TOTAL, LEASES_NEVER_CONNECTED_TOTAL, LEASES_TERMINATED_TOTAL,
    RETRY_EXHAUSTED_TOTAL,
};

/// Statistics from a single GC pass.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub never_connected: u32,
    pub ttl_expired: u32,
    pub terminated: u32,
    pub retries: u32,
}

pub struct GarbageCollector {
    db: Database,
    controller: Arc<dyn ControllerAdapter>,
    agents: Arc<dyn NodeAgentApi>,
    config: Arc<Config>,
    /// Consecutive teardown failures per TERMINATING lease. Advisory and
    /// in-memory: a restart resets the budget, which is the documented way
    /// for an operator to resume retries.
    retries: Mutex<HashMap<String, u32>>,
    /// Hosts already flagged stale, so the event fires once per outage.
    flagged_stale: Mutex<HashSet<String>>,
}

impl GarbageCollector {
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
            retries: Mutex::new(HashMap::new()),
            flagged_stale: Mutex::new(HashSet::new()),
        }
    }

    /// Run the garbage collector until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.gc_interval.as_secs(),
            "Starting garbage collector"
        );
        let mut interval = tokio::time::interval(self.config.gc_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.gc_once().await {
                        warn!(error = %e, "GC tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Garbage collector shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full GC pass.
    pub async fn gc_once(&self) -> Result<GcStats, DbError> {
        let mut stats = GcStats::default();

        self.enforce_deadlines(&mut stats).await?;
        self.teardown_terminating(&mut stats).await?;
        self.flag_stale_hosts().await?;
        self.db.events().prune(self.config.event_retention).await?;
        set_lease_gauges(&self.db.leases().counts_by_state().await?);

        if stats.terminated > 0 || stats.never_connected > 0 || stats.ttl_expired > 0 {
            info!(
                terminated = stats.terminated,
                never_connected = stats.never_connected,
                ttl_expired = stats.ttl_expired,
                "GC pass complete"
            );
        }
        Ok(stats)
    }

    async fn enforce_deadlines(&self, stats: &mut GcStats) -> Result<(), DbError> {
        let store = self.db.leases();
        let now = Utc::now();

        for lease in store.list_non_terminal().await? {
            if lease.state == LeaseState::Terminating {
                continue;
            }

            // Invariant: anything past REQUESTED must be bound to a host.
            if lease.host_id.is_none() && lease.state != LeaseState::Requested {
                tracing::error!(
                    lease_id = %lease.lease_id,
                    state = %lease.state,
                    "Lease has no host past REQUESTED; failing it"
                );
                store
                    .transition(
                        &lease.lease_id,
                        lease.state,
                        LeaseState::Failed,
                        "lease.failed",
                        serde_json::json!({ "reason": "invariant_violation" }),
                        Some("invariant_violation"),
                    )
                    .await?;
                continue;
            }

            let pre_connect = matches!(
                lease.state,
                LeaseState::Requested
                    | LeaseState::Provisioning
                    | LeaseState::Booting
                    | LeaseState::Connecting
            );
            if pre_connect && lease.last_heartbeat.is_none() && now > lease.connect_deadline {
                let moved = store
                    .transition(
                        &lease.lease_id,
                        lease.state,
                        LeaseState::Terminating,
                        "lease.never_connected",
                        serde_json::json!({
                            "reason": "never_connected",
                            "host_id": lease.host_id,
                        }),
                        Some("never_connected"),
                    )
                    .await?;
                if moved {
                    counter!(LEASES_NEVER_CONNECTED_TOTAL).increment(1);
                    stats.never_connected += 1;
                }
                continue;
            }

            if now > lease.ttl_deadline {
                let moved = store
                    .transition(
                        &lease.lease_id,
                        lease.state,
                        LeaseState::Terminating,
                        "lease.ttl_expired",
                        serde_json::json!({
                            "reason": "ttl_expired",
                            "host_id": lease.host_id,
                        }),
                        Some("ttl_expired"),
                    )
                    .await?;
                if moved {
                    stats.ttl_expired += 1;
                }
            }
        }
        Ok(())
    }

    async fn teardown_terminating(&self, stats: &mut GcStats) -> Result<(), DbError> {
        let store = self.db.leases();
        let events = self.db.events();

        for lease in store.list_non_terminal().await? {
            if lease.state != LeaseState::Terminating {
                continue;
            }
            if self.budget_spent(&lease.lease_id) {
                continue;
            }

            if !self.delete_vm_for(&lease, stats, &events).await? {
                continue;
            }

            // VM confirmed gone; the controller node is best-effort. A
            // leftover is swept by the reconciler as a stale node.
            if let Err(e) = self
                .controller
                .delete_node(&lease.controller_node_name)
                .await
            {
                warn!(
                    lease_id = %lease.lease_id,
                    node = %lease.controller_node_name,
                    error = %e,
                    "Controller node delete failed; leaving for reconciler"
                );
            }

            let reason = lease.last_error.clone().unwrap_or_else(|| "done".to_string());
            let moved = store
                .transition(
                    &lease.lease_id,
                    LeaseState::Terminating,
                    LeaseState::Terminated,
                    "lease.terminated",
                    serde_json::json!({ "reason": reason, "host_id": lease.host_id }),
                    None,
                )
                .await?;
            if moved {
                counter!(LEASES_TERMINATED_TOTAL).increment(1);
                stats.terminated += 1;
                self.retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&lease.lease_id);
            }
        }
        Ok(())
    }

    /// Issue the node-agent DELETE. Returns `true` once the VM is
    /// confirmed gone (including "no host was ever assigned").
    async fn delete_vm_for(
        &self,
        lease: &Lease,
        stats: &mut GcStats,
        events: &crate::db::EventStore,
    ) -> Result<bool, DbError> {
        let Some(host_id) = &lease.host_id else {
            // Terminated before placement: there is no VM to delete.
            return Ok(true);
        };
        let agent_url = match self.db.hosts().get(host_id).await? {
            Some(host) => host.agent_url,
            None => None,
        };
        let Some(agent_url) = agent_url else {
            warn!(lease_id = %lease.lease_id, host_id = %host_id, "No agent URL for teardown");
            return Ok(true);
        };

        let reason = lease.last_error.as_deref().unwrap_or("terminate");
        match self.agents.delete_vm(&agent_url, &lease.vm_id, reason).await {
            Ok(()) => Ok(true),
            Err(e) => {
                stats.retries += 1;
                events
                    .append(
                        "lease.terminate_retry",
                        Some(&lease.lease_id),
                        serde_json::json!({
                            "error_type": e.error_type(),
                            "error_detail": e.to_string(),
                            "host_id": host_id,
                            "node_agent_url": agent_url,
                        }),
                    )
                    .await?;
                let spent = {
                    let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
                    let count = retries.entry(lease.lease_id.clone()).or_insert(0);
                    *count += 1;
                    *count >= self.config.retry_budget
                };
                if spent {
                    counter!(RETRY_EXHAUSTED_TOTAL).increment(1);
                    events
                        .append(
                            "lease.retry_exhausted",
                            Some(&lease.lease_id),
                            serde_json::json!({
                                "host_id": host_id,
                                "budget": self.config.retry_budget,
                            }),
                        )
                        .await?;
                    warn!(
                        lease_id = %lease.lease_id,
                        budget = self.config.retry_budget,
                        "Teardown retry budget exhausted; leaving TERMINATING for operator"
                    );
                }
                Ok(false)
            }
        }
    }

    fn budget_spent(&self, lease_id: &str) -> bool {
        self.retries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(lease_id)
            .map(|count| *count >= self.config.retry_budget)
            .unwrap_or(false)
    }

    /// Emit `host.stale` once per outage for enabled hosts whose heartbeat
    /// lapsed.
    async fn flag_stale_hosts(&self) -> Result<(), DbError> {
        let now = Utc::now();
        let cutoff = self.config.host_stale_after();
        let events = self.db.events();

        for host in self.db.hosts().list().await? {
            if !host.enabled {
                continue;
            }
            let stale = host
                .last_seen
                .map(|seen| now - seen > cutoff)
                .unwrap_or(false);
            let newly_stale = {
                let mut flagged = self.flagged_stale.lock().unwrap_or_else(|e| e.into_inner());
                if stale {
                    flagged.insert(host.host_id.clone())
                } else {
                    flagged.remove(&host.host_id);
                    false
                }
            };
            if newly_stale {
                counter!(HOST_STALE_TOTAL).increment(1);
                events
                    .append(
                        "host.stale",
                        None,
                        serde_json::json!({
                            "host_id": host.host_id,
                            "last_seen": host.last_seen.map(|t| t.to_rfc3339()),
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
