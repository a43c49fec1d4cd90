//! Scaler: per-label deficit computation and launch fan-out.
//!
//! Every tick reads the controller queue, compares it against in-flight
//! leases, and launches up to `min(deficit, LABEL_BURST, remaining label
//! headroom, remaining global headroom, placeable hosts)` new leases. A
//! per-label cooldown after any non-zero launch damps oscillation while
//! slow VMs boot. Queue reads are best-effort: a failed snapshot skips the
//! tick, and over-launches are recovered by the GC and reconciler.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clients::ControllerAdapter;
use crate::config::Config;
use crate::db::{AdmissionCaps, Database, DbError};
use crate::lease::Lease;
use crate::placement::Placement;
use crate::provision::{ProvisionError, Provisioner};

/// Statistics from a single scaler pass.
#[derive(Debug, Default, Clone)]
pub struct ScaleStats {
    pub labels_considered: u32,
    pub launched: u32,
    pub rejected: u32,
}

pub struct Scaler {
    db: Database,
    controller: Arc<dyn ControllerAdapter>,
    provisioner: Provisioner,
    placement: Placement,
    config: Arc<Config>,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Scaler {
    pub fn new(
        db: Database,
        controller: Arc<dyn ControllerAdapter>,
        provisioner: Provisioner,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            controller,
            provisioner,
            placement: Placement::new(),
            config,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Run the scaler until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.loop_interval.as_secs(),
            "Starting scaler"
        );
        let mut interval = tokio::time::interval(self.config.loop_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scale_once().await {
                        warn!(error = %e, "Scaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scaler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One scaling pass over every queued label.
    pub async fn scale_once(&self) -> Result<ScaleStats, DbError> {
        let mut stats = ScaleStats::default();

        let snapshot = match self.controller.queue_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Queue snapshot failed; skipping scaler tick");
                return Ok(stats);
            }
        };

        let hosts = self.db.hosts().list().await?;
        let leases = self.db.leases();
        let now = Utc::now();

        // Deterministic label order keeps launches reproducible when the
        // global cap forces some labels to lose.
        let mut queued: Vec<(String, i64)> = snapshot.into_iter().collect();
        queued.sort();

        for (label, queued_count) in queued {
            if queued_count <= 0 {
                continue;
            }
            stats.labels_considered += 1;
            if self.cooldown_active(&label, now) {
                debug!(label = %label, "Label in cooldown; skipping");
                continue;
            }

            let inflight = leases.count_inflight(&label).await?;
            let idle_ready = 0i64; // single-use VMs: nothing idles by design
            let raw_deficit = queued_count - inflight - idle_ready;
            if raw_deficit <= 0 {
                continue;
            }

            let total_active = leases.count_non_terminal().await?;
            let launchable = raw_deficit
                .min(self.config.label_burst)
                .min(self.config.label_max_inflight - inflight)
                .min(self.config.global_max_vms - total_active);
            if launchable <= 0 {
                continue;
            }

            let launched = self
                .launch(&label, launchable, &hosts, &mut stats)
                .await?;
            if launched > 0 {
                let until = now + ChronoDuration::seconds(self.config.cooldown_sec as i64);
                self.cooldowns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(label.clone(), until);
                info!(label = %label, launched, "Scaler launched leases");
            }
        }

        Ok(stats)
    }

    async fn launch(
        &self,
        label: &str,
        launchable: i64,
        hosts: &[crate::host::Host],
        stats: &mut ScaleStats,
    ) -> Result<u32, DbError> {
        let leases = self.db.leases();
        let events = self.db.events();
        let caps = AdmissionCaps {
            global_max_vms: self.config.global_max_vms,
            label_max_inflight: self.config.label_max_inflight,
        };
        let mut launched = 0u32;

        for _ in 0..launchable {
            let lease = Lease::new_requested(
                label,
                &self.config.node_name_prefix,
                self.config.connect_deadline_sec,
                self.config.vm_ttl_sec,
            );
            let demand = lease.profile();

            let host_id = match self.placement.pick(
                hosts,
                label,
                &demand,
                self.config.host_stale_after(),
            ) {
                Ok(host_id) => host_id,
                Err(rejection) => {
                    stats.rejected += 1;
                    events
                        .append(
                            "scale.placement_rejected",
                            None,
                            serde_json::json!({ "label": label, "reason": rejection.to_string() }),
                        )
                        .await?;
                    debug!(label, reason = %rejection, "Placement rejected");
                    break;
                }
            };
            let Some(host) = hosts.iter().find(|h| h.host_id == host_id) else {
                break;
            };

            match leases.create_requested(&lease, caps).await {
                Ok(()) => {}
                Err(DbError::CapExceeded(which)) => {
                    debug!(label, cap = which, "Admission cap hit inside transaction");
                    break;
                }
                Err(e) => return Err(e),
            }
            events
                .append(
                    "scale.launch",
                    Some(&lease.lease_id),
                    serde_json::json!({ "label": label, "host_id": host_id }),
                )
                .await?;

            match self.provisioner.provision(&lease, host).await {
                Ok(()) => launched += 1,
                Err(ProvisionError::Db(e)) => return Err(e),
                Err(e) => {
                    // The provisioner already failed the lease and emitted
                    // scale.launch_failed; keep going with the next one.
                    warn!(lease_id = %lease.lease_id, error = %e, "Launch failed");
                }
            }
        }

        stats.launched += launched;
        Ok(launched)
    }

    fn cooldown_active(&self, label: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(label)
            .map(|until| *until > now)
            .unwrap_or(false)
    }
}
