//! Prometheus metrics endpoint.

use axum::{extract::State, response::IntoResponse, routing::get, Router};

use crate::api::error::ApiError;
use crate::metrics::set_lease_gauges;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/metrics", get(render))
}

/// GET /metrics
///
/// Gauges are refreshed from the store on every scrape so they stay honest
/// even while the GC loop is disabled.
async fn render(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let counts = state.db().leases().counts_by_state().await?;
    set_lease_gauges(&counts);
    Ok(state.metrics().render())
}
