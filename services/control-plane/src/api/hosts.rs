//! Host API endpoints.
//!
//! Registration and heartbeats are called by node agents; enable/disable
//! and the listing are operator-facing. Agents authenticate with a bearer
//! token: the provisioned bootstrap token for registration, the issued
//! session token for everything after.

use axum::{
    extract::{Path, State},
    http::header::AUTHORIZATION,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::auth::{hash_token, new_session_token, verify_token};
use crate::db::Registration;
use crate::host::{Host, Platform};
use crate::metrics::AUTH_FAILURES_TOTAL;
use crate::state::AppState;

const SESSION_VALID_HOURS: i64 = 1;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/hosts", get(list_hosts))
        .route("/hosts/{host_id}/register", post(register))
        .route("/hosts/{host_id}/heartbeat", post(heartbeat))
        .route("/hosts/{host_id}/enable", post(enable))
        .route("/hosts/{host_id}/disable", post(disable))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub agent_version: String,

    /// Base URL the control plane should use to reach this agent.
    pub agent_url: String,

    pub cpu_total: i64,
    pub ram_total_mb: i64,

    #[serde(default)]
    pub os_family: Option<String>,
    #[serde(default)]
    pub os_flavor: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub selected_accel: Option<String>,
    #[serde(default)]
    pub supported_accels: Vec<String>,

    /// Labels this host serves; empty means all.
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RegisterResponse {
    pub host_id: String,
    pub enabled: bool,
    pub session_token: String,
    pub session_expires_at: DateTime<Utc>,
    pub heartbeat_interval_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub cpu_free: i64,
    pub ram_free_mb: i64,
    pub io_pressure: f64,

    /// The agent's live VM inventory.
    #[serde(default)]
    pub active_vm_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

// =============================================================================
// Handlers
// =============================================================================

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing_token", "missing bearer token"))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| ApiError::unauthorized("missing_token", "missing bearer token"))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ApiError::unauthorized("missing_token", "missing bearer token"));
    }
    Ok(token.to_string())
}

async fn auth_failure(state: &AppState, host_id: &str, detail: &str) -> ApiError {
    counter!(AUTH_FAILURES_TOTAL).increment(1);
    let _ = state
        .db()
        .events()
        .append(
            "auth.fail",
            None,
            serde_json::json!({ "host_id": host_id, "detail": detail }),
        )
        .await;
    ApiError::unauthorized("invalid_token", detail.to_string())
}

/// Exchange the bootstrap token for a session token.
///
/// POST /v1/hosts/{host_id}/register
async fn register(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers)?;

    if req.cpu_total < 1 {
        return Err(ApiError::bad_request("invalid_capacity", "cpu_total must be at least 1"));
    }
    if req.ram_total_mb < 256 {
        return Err(ApiError::bad_request(
            "invalid_capacity",
            "ram_total_mb must be at least 256",
        ));
    }
    if req.agent_url.is_empty() {
        return Err(ApiError::bad_request("invalid_agent_url", "agent_url cannot be empty"));
    }

    let hosts = state.db().hosts();
    let host = match hosts.get(&host_id).await? {
        Some(host) => host,
        None if state.config().allow_unknown_host_registration => {
            // Dev convenience only: adopt the presented token as the
            // bootstrap credential for the new row.
            hosts.provision(&host_id, &hash_token(&token)).await?;
            hosts
                .get(&host_id)
                .await?
                .ok_or_else(|| ApiError::internal("internal_error", "host row vanished"))?
        }
        None => return Err(ApiError::not_found("unknown_host", "unknown host")),
    };

    if !verify_token(&token, host.bootstrap_token_hash.as_deref()) {
        return Err(auth_failure(&state, &host_id, "invalid bootstrap token").await);
    }

    let (session_token, session_expires_at) = new_session_token(SESSION_VALID_HOURS);
    let registration = Registration {
        platform: Platform {
            os_family: req.os_family,
            os_flavor: req.os_flavor,
            os_version: req.os_version,
            cpu_arch: req.cpu_arch,
            selected_accel: req.selected_accel,
            supported_accels: req.supported_accels,
        },
        labels: req.labels,
        agent_url: req.agent_url,
        cpu_total: req.cpu_total,
        ram_total_mb: req.ram_total_mb,
    };
    hosts
        .complete_registration(
            &host_id,
            &hash_token(&session_token),
            session_expires_at,
            &registration,
        )
        .await?;
    state
        .db()
        .events()
        .append(
            "host.registered",
            None,
            serde_json::json!({ "host_id": host_id, "agent_version": req.agent_version }),
        )
        .await?;
    info!(host_id = %host_id, "Host registered");

    Ok(Json(RegisterResponse {
        host_id,
        enabled: host.enabled,
        session_token,
        session_expires_at,
        heartbeat_interval_sec: state.config().heartbeat_interval_sec,
    }))
}

/// Absorb a capacity + inventory heartbeat.
///
/// POST /v1/hosts/{host_id}/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers)?;

    let hosts = state.db().hosts();
    let host = hosts
        .get(&host_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown_host", "unknown host"))?;
    if !host.enabled {
        return Err(ApiError::forbidden("host_disabled", "host disabled"));
    }
    let expired = host
        .session_expires_at
        .map(|at| Utc::now() > at)
        .unwrap_or(true);
    if expired {
        return Err(auth_failure(&state, &host_id, "session expired").await);
    }
    if !verify_token(&token, host.session_token_hash.as_deref()) {
        return Err(auth_failure(&state, &host_id, "invalid session token").await);
    }

    if req.cpu_free < 0 || req.ram_free_mb < 0 {
        return Err(ApiError::bad_request("invalid_capacity", "negative capacity"));
    }
    if !(0.0..=1.0).contains(&req.io_pressure) {
        return Err(ApiError::bad_request(
            "invalid_capacity",
            "io_pressure must be within [0, 1]",
        ));
    }

    hosts
        .record_heartbeat(
            &host_id,
            req.cpu_free,
            req.ram_free_mb,
            req.io_pressure,
            &req.active_vm_ids,
        )
        .await?;
    state
        .db()
        .events()
        .append(
            "host.heartbeat",
            None,
            serde_json::json!({ "host_id": host_id, "active_vm_ids": req.active_vm_ids }),
        )
        .await?;

    Ok(Json(OkResponse { ok: true }))
}

/// POST /v1/hosts/{host_id}/enable
async fn enable(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_enabled(&state, &host_id, true).await
}

/// POST /v1/hosts/{host_id}/disable
///
/// Excludes the host from placement and drops its session. Existing leases
/// keep running.
async fn disable(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_enabled(&state, &host_id, false).await
}

async fn set_enabled(
    state: &AppState,
    host_id: &str,
    enabled: bool,
) -> Result<Json<OkResponse>, ApiError> {
    let changed = state.db().hosts().set_enabled(host_id, enabled).await?;
    if !changed {
        return Err(ApiError::not_found("unknown_host", "unknown host"));
    }
    let event = if enabled { "host.enabled" } else { "host.disabled" };
    state
        .db()
        .events()
        .append(event, None, serde_json::json!({ "host_id": host_id }))
        .await?;
    info!(host_id = %host_id, enabled, "Host enablement changed");
    Ok(Json(OkResponse { ok: true }))
}

/// GET /v1/hosts
async fn list_hosts(State(state): State<AppState>) -> Result<Json<Vec<Host>>, ApiError> {
    Ok(Json(state.db().hosts().list().await?))
}
