//! Reconciler: three-way diff across controller nodes, node-agent VM
//! inventories, and the lease store.
//!
//! Drift it corrects:
//! - controller nodes with our name prefix but no backing lease are deleted
//! - node-agent VMs no live lease owns are deleted (orphans)
//! - BOOTING leases whose VM never appeared within the boot grace are
//!   failed (this loop is the only component allowed to do that)
//! - RUNNING leases whose controller node is gone or offline past the
//!   disconnect grace are sent to TERMINATING
//!
//! It also drives lease progress from controller observations: a node
//! reporting online moves BOOTING to CONNECTING, and online+busy moves
//! CONNECTING to RUNNING. An unreachable controller or agent is treated as
//! *no information*; absence is only ever concluded from a successful
//! query.

use chrono::Utc;
use metrics::{counter, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clients::{ControllerAdapter, NodeAgentApi};
use crate::config::Config;
use crate::db::{Database, DbError};
use crate::lease::{Lease, LeaseState};
use crate::metrics::{
    ORPHAN_VM_CLEANUP_TOTAL, QUEUE_TO_CONNECT_SECONDS, STALE_CONTROLLER_NODES_TOTAL,
};

/// Statistics from a single reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct ReconcileStats {
    pub stale_nodes_removed: u32,
    pub orphan_vms_removed: u32,
    pub leases_failed: u32,
    pub leases_advanced: u32,
    pub leases_disconnected: u32,
}

pub struct Reconciler {
    db: Database,
    controller: Arc<dyn ControllerAdapter>,
    agents: Arc<dyn NodeAgentApi>,
    config: Arc<Config>,
}

impl Reconciler {
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

    /// Run the reconciler until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.loop_interval.as_secs(),
            "Starting reconciler"
        );
        let mut interval = tokio::time::interval(self.config.loop_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "Reconciler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full three-way diff plus lease progress pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileStats, DbError> {
        let mut stats = ReconcileStats::default();
        let leases = self.db.leases().list_non_terminal().await?;
        let hosts = self.db.hosts().list().await?;

        let by_node: HashMap<&str, &Lease> = leases
            .iter()
            .map(|l| (l.controller_node_name.as_str(), l))
            .collect();
        let by_vm: HashMap<&str, &Lease> =
            leases.iter().map(|l| (l.vm_id.as_str(), l)).collect();

        self.sweep_controller_nodes(&by_node, &mut stats).await;
        let inventories = self.sweep_agent_vms(&hosts, &by_vm, &mut stats).await;
        self.drive_leases(&leases, &inventories, &mut stats).await?;

        if stats.stale_nodes_removed > 0
            || stats.orphan_vms_removed > 0
            || stats.leases_failed > 0
            || stats.leases_disconnected > 0
        {
            info!(
                stale_nodes_removed = stats.stale_nodes_removed,
                orphan_vms_removed = stats.orphan_vms_removed,
                leases_failed = stats.leases_failed,
                leases_disconnected = stats.leases_disconnected,
                "Reconciliation corrected drift"
            );
        }
        Ok(stats)
    }

    /// Delete controller nodes that carry our prefix but have no lease.
    async fn sweep_controller_nodes(
        &self,
        by_node: &HashMap<&str, &Lease>,
        stats: &mut ReconcileStats,
    ) {
        let names = match self
            .controller
            .list_nodes_with_prefix(&self.config.node_name_prefix)
            .await
        {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Controller node listing failed; skipping node sweep");
                return;
            }
        };

        for name in names {
            if by_node.contains_key(name.as_str()) {
                continue;
            }
            match self.controller.delete_node(&name).await {
                Ok(()) => {
                    counter!(STALE_CONTROLLER_NODES_TOTAL).increment(1);
                    stats.stale_nodes_removed += 1;
                    let _ = self
                        .db
                        .events()
                        .append(
                            "controller.stale_node_removed",
                            None,
                            serde_json::json!({ "node_name": name }),
                        )
                        .await;
                }
                Err(e) => warn!(node = %name, error = %e, "Stale node delete failed"),
            }
        }
    }

    /// Delete agent VMs no live lease owns; return the inventory observed
    /// per host. Hosts whose agent could not be queried are absent from the
    /// result: unknown, not empty.
    async fn sweep_agent_vms(
        &self,
        hosts: &[crate::host::Host],
        by_vm: &HashMap<&str, &Lease>,
        stats: &mut ReconcileStats,
    ) -> HashMap<String, HashSet<String>> {
        let mut inventories = HashMap::new();

        for host in hosts {
            let Some(agent_url) = &host.agent_url else {
                continue;
            };
            let vms = match self.agents.list_vms(agent_url).await {
                Ok(vms) => vms,
                Err(e) => {
                    debug!(host_id = %host.host_id, error = %e, "Agent inventory unavailable");
                    continue;
                }
            };

            let mut seen = HashSet::new();
            for vm in vms {
                if by_vm.contains_key(vm.vm_id.as_str()) {
                    seen.insert(vm.vm_id);
                    continue;
                }
                match self.agents.delete_vm(agent_url, &vm.vm_id, "orphan").await {
                    Ok(()) => {
                        counter!(ORPHAN_VM_CLEANUP_TOTAL).increment(1);
                        stats.orphan_vms_removed += 1;
                        let _ = self
                            .db
                            .events()
                            .append(
                                "orphan_vm_cleanup",
                                None,
                                serde_json::json!({
                                    "vm_id": vm.vm_id,
                                    "host_id": host.host_id,
                                }),
                            )
                            .await;
                    }
                    Err(e) => {
                        warn!(vm_id = %vm.vm_id, host_id = %host.host_id, error = %e,
                              "Orphan VM delete failed")
                    }
                }
            }
            inventories.insert(host.host_id.clone(), seen);
        }

        inventories
    }

    /// Apply per-lease corrections and controller-driven progress.
    async fn drive_leases(
        &self,
        leases: &[Lease],
        inventories: &HashMap<String, HashSet<String>>,
        stats: &mut ReconcileStats,
    ) -> Result<(), DbError> {
        let store = self.db.leases();
        let now = Utc::now();

        for lease in leases {
            match lease.state {
                LeaseState::Booting => {
                    // A successfully fetched inventory that lacks the VM is
                    // positive evidence the launch was lost.
                    let vm_missing = lease
                        .host_id
                        .as_ref()
                        .and_then(|h| inventories.get(h))
                        .map(|inv| !inv.contains(&lease.vm_id))
                        .unwrap_or(false);
                    if vm_missing && now > lease.updated_at + self.config.boot_grace() {
                        let failed = store
                            .transition(
                                &lease.lease_id,
                                LeaseState::Booting,
                                LeaseState::Failed,
                                "lease.failed",
                                serde_json::json!({
                                    "reason": "vm_missing",
                                    "host_id": lease.host_id,
                                    "error_type": "vm_missing",
                                    "error_detail": "VM absent from agent inventory past boot grace",
                                }),
                                Some("vm_missing"),
                            )
                            .await?;
                        if failed {
                            stats.leases_failed += 1;
                            continue;
                        }
                    }

                    if let Ok(Some(state)) =
                        self.controller.node_state(&lease.controller_node_name).await
                    {
                        if state.online {
                            let advanced = store
                                .transition(
                                    &lease.lease_id,
                                    LeaseState::Booting,
                                    LeaseState::Connecting,
                                    "lease.connecting",
                                    serde_json::json!({ "host_id": lease.host_id }),
                                    None,
                                )
                                .await?;
                            if advanced {
                                store.touch_heartbeat(&lease.lease_id, now).await?;
                                let wait = (now - lease.created_at).num_milliseconds() as f64
                                    / 1000.0;
                                histogram!(QUEUE_TO_CONNECT_SECONDS).record(wait);
                                stats.leases_advanced += 1;
                            }
                        }
                    }
                }

                LeaseState::Connecting => {
                    if let Ok(Some(state)) =
                        self.controller.node_state(&lease.controller_node_name).await
                    {
                        if state.online {
                            store.touch_heartbeat(&lease.lease_id, now).await?;
                            if state.busy {
                                let advanced = store
                                    .transition(
                                        &lease.lease_id,
                                        LeaseState::Connecting,
                                        LeaseState::Running,
                                        "lease.running",
                                        serde_json::json!({ "host_id": lease.host_id }),
                                        None,
                                    )
                                    .await?;
                                if advanced {
                                    stats.leases_advanced += 1;
                                }
                            }
                        }
                    }
                }

                LeaseState::Running => {
                    match self.controller.node_state(&lease.controller_node_name).await {
                        Ok(Some(state)) if state.online => {
                            store.touch_heartbeat(&lease.lease_id, now).await?;
                        }
                        // Gone or offline: give the grace period, then
                        // tear down.
                        Ok(_) => {
                            let last = lease.last_heartbeat.unwrap_or(lease.updated_at);
                            if now > last + self.config.disconnected_grace() {
                                let moved = store
                                    .transition(
                                        &lease.lease_id,
                                        LeaseState::Running,
                                        LeaseState::Terminating,
                                        "lease.disconnected",
                                        serde_json::json!({
                                            "reason": "unexpected_disconnect",
                                            "host_id": lease.host_id,
                                        }),
                                        Some("unexpected_disconnect"),
                                    )
                                    .await?;
                                if moved {
                                    stats.leases_disconnected += 1;
                                }
                            }
                        }
                        Err(e) => {
                            debug!(lease_id = %lease.lease_id, error = %e,
                                   "Controller state unavailable; no action")
                        }
                    }
                }

                _ => {}
            }
        }

        Ok(())
    }
}
