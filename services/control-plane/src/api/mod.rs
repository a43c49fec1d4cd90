//! HTTP API handlers and routing.

pub mod error;
mod health;
mod hosts;
mod leases;
mod metrics;
mod ui;
mod vms;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let v1 = hosts::routes().merge(leases::routes()).merge(vms::routes());
    Router::new()
        .merge(health::routes())
        .merge(metrics::routes())
        .merge(ui::routes())
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
