//! Lease API endpoints (operator-facing, read + force-terminate only).

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::db::LeaseFilter;
use crate::lease::{Lease, LeaseState};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/leases", get(list_leases))
        .route("/leases/{lease_id}/terminate", post(terminate))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub label: Option<String>,
    pub state: Option<String>,
    pub host_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct LeaseResponse {
    pub lease_id: String,
    pub vm_id: String,
    pub label: String,
    pub controller_node_name: String,
    pub state: String,
    pub host_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub connect_deadline: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<Lease> for LeaseResponse {
    fn from(lease: Lease) -> Self {
        Self {
            lease_id: lease.lease_id,
            vm_id: lease.vm_id,
            label: lease.label,
            controller_node_name: lease.controller_node_name,
            state: lease.state.as_str().to_string(),
            host_id: lease.host_id,
            created_at: lease.created_at,
            connect_deadline: lease.connect_deadline,
            ttl_deadline: lease.ttl_deadline,
            last_heartbeat: lease.last_heartbeat,
            last_error: lease.last_error,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    #[serde(default = "default_terminate_reason")]
    pub reason: String,
}

fn default_terminate_reason() -> String {
    "manual_terminate".to_string()
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub ok: bool,
    /// False when the lease was already TERMINATING or terminal.
    pub changed: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /v1/leases?label=&state=&host_id=
async fn list_leases(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let state_filter = match query.state.as_deref() {
        Some(raw) => Some(
            LeaseState::parse(raw)
                .ok_or_else(|| ApiError::bad_request("invalid_state", format!("unknown state {raw:?}")))?,
        ),
        None => None,
    };
    let filter = LeaseFilter {
        label: query.label,
        state: state_filter,
        host_id: query.host_id,
    };
    let leases = state.db().leases().list(&filter).await?;
    Ok(Json(
        leases.into_iter().map(LeaseResponse::from).collect::<Vec<_>>(),
    ))
}

/// Force a lease to TERMINATING; the GC performs the actual teardown.
///
/// POST /v1/leases/{lease_id}/terminate
async fn terminate(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
    Json(req): Json<TerminateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.db().leases();
    if store.get(&lease_id).await?.is_none() {
        return Err(ApiError::not_found("unknown_lease", "unknown lease"));
    }
    let changed = store
        .force_terminating(&lease_id, "lease.manual_terminate", &req.reason)
        .await?;
    if changed {
        info!(lease_id = %lease_id, reason = %req.reason, "Lease manually terminated");
    }
    Ok(Json(TerminateResponse { ok: true, changed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_request_defaults_reason() {
        let req: TerminateRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.reason, "manual_terminate");
    }

    #[test]
    fn lease_response_carries_last_error() {
        let lease = Lease::new_requested("linux", "ephemeral-", 240, 7200);
        let mut response = LeaseResponse::from(lease);
        response.last_error = Some("never_connected".into());
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("never_connected"));
        assert!(json.contains("\"state\":\"REQUESTED\""));
    }
}
