//! Metric names and recorder installation.
//!
//! Counters and gauges go through the `metrics` facade; `/metrics` renders
//! the Prometheus text format from the installed recorder. The recorder is
//! process-wide and installed once.

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::lease::LeaseState;

pub const HOST_STALE_TOTAL: &str = "host_stale_total";
pub const LEASES_NEVER_CONNECTED_TOTAL: &str = "leases_never_connected_total";
pub const ORPHAN_VM_CLEANUP_TOTAL: &str = "orphan_vm_cleanup_total";
pub const RETRY_EXHAUSTED_TOTAL: &str = "retry_exhausted_total";
pub const LAUNCH_ATTEMPTS_TOTAL: &str = "launch_attempts_total";
pub const LEASES_TERMINATED_TOTAL: &str = "leases_terminated_total";
pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
pub const STALE_CONTROLLER_NODES_TOTAL: &str = "stale_controller_nodes_total";
pub const QUEUE_TO_CONNECT_SECONDS: &str = "queue_to_connect_seconds";
pub const LEASES_BY_STATE: &str = "leases_by_state";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder (idempotent; tests share one process).
pub fn install() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(QUEUE_TO_CONNECT_SECONDS.to_string()),
        &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 240.0, 480.0],
    )?;
    match builder.install_recorder() {
        Ok(handle) => {
            describe();
            Ok(HANDLE.get_or_init(|| handle).clone())
        }
        // Lost an install race: the winner's handle is in the cell.
        Err(e) => HANDLE.get().cloned().ok_or(e),
    }
}

fn describe() {
    describe_counter!(HOST_STALE_TOTAL, "Hosts whose heartbeats went stale");
    describe_counter!(
        LEASES_NEVER_CONNECTED_TOTAL,
        "Leases terminated for missing their connect deadline"
    );
    describe_counter!(ORPHAN_VM_CLEANUP_TOTAL, "Node-agent VMs deleted as orphans");
    describe_counter!(
        RETRY_EXHAUSTED_TOTAL,
        "Teardowns abandoned to operator attention after the retry budget"
    );
    describe_counter!(LAUNCH_ATTEMPTS_TOTAL, "Provisioning attempts started");
    describe_counter!(LEASES_TERMINATED_TOTAL, "Leases fully terminated");
    describe_counter!(AUTH_FAILURES_TOTAL, "Rejected host credentials");
    describe_counter!(
        STALE_CONTROLLER_NODES_TOTAL,
        "Controller nodes deleted with no backing lease"
    );
    describe_histogram!(
        QUEUE_TO_CONNECT_SECONDS,
        "Seconds from lease creation to the VM connecting back"
    );
    describe_gauge!(LEASES_BY_STATE, "Current lease count per state");
}

/// Refresh the per-state lease gauges, zeroing states with no leases.
pub fn set_lease_gauges(counts: &HashMap<LeaseState, i64>) {
    for state in LeaseState::ALL {
        let value = counts.get(&state).copied().unwrap_or(0);
        gauge!(LEASES_BY_STATE, "state" => state.as_str()).set(value as f64);
    }
}
