//! VM status push endpoint.
//!
//! Node agents report VM state changes here so the control plane hears
//! about crashes without waiting for the reconciler's next inventory diff.
//! Reports never advance a lease forward (connecting/running progress
//! only ever comes from controller observations), but a terminal agent
//! state forces teardown.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/vms/{vm_id}/status", post(vm_status))
}

#[derive(Debug, Deserialize)]
pub struct VmStatusRequest {
    /// Agent-side VM state: "starting", "running", "stopped", "crashed".
    pub state: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VmStatusResponse {
    pub ok: bool,
}

/// POST /v1/vms/{vm_id}/status
async fn vm_status(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.db().leases();
    let lease = store
        .get_live_by_vm(&vm_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown_vm", "no live lease for vm"))?;

    state
        .db()
        .events()
        .append(
            "vm.status",
            Some(&lease.lease_id),
            serde_json::json!({
                "vm_id": vm_id,
                "state": req.state,
                "reason": req.reason,
                "host_id": lease.host_id,
            }),
        )
        .await?;

    if matches!(req.state.as_str(), "stopped" | "crashed") {
        let reason = req
            .reason
            .unwrap_or_else(|| format!("vm_{}", req.state));
        let changed = store
            .force_terminating(&lease.lease_id, "lease.vm_gone", &reason)
            .await?;
        if changed {
            info!(vm_id = %vm_id, lease_id = %lease.lease_id, reason = %reason,
                  "Agent reported VM gone");
        }
    }

    Ok(Json(VmStatusResponse { ok: true }))
}
