//! ember control plane.
//!
//! Hosts the HTTP API plus the three control loops (scaler, reconciler,
//! garbage collector) that drive the lease state machine. The store is the
//! only authoritative state: restart recovery is simply reloading it.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ember_control_plane::clients::{HttpNodeAgent, JenkinsController};
use ember_control_plane::config::Config;
use ember_control_plane::db::Database;
use ember_control_plane::gc::GarbageCollector;
use ember_control_plane::provision::Provisioner;
use ember_control_plane::reconciler::Reconciler;
use ember_control_plane::scaler::Scaler;
use ember_control_plane::state::AppState;
use ember_control_plane::{api, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ember control plane");

    let config = Config::from_env()?;
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db = match Database::connect(&config.database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };
    if let Err(e) = db.run_migrations().await {
        error!(error = %e, "Failed to run migrations; refusing to start");
        return Err(e.into());
    }

    let metrics_handle = metrics::install()?;

    let controller = Arc::new(JenkinsController::new(
        &config.controller_url,
        &config.controller_user,
        &config.controller_api_token,
        config.rpc_timeout,
    )?);
    let agents = Arc::new(HttpNodeAgent::new(
        config.rpc_timeout,
        config.node_agent_auth_token.clone(),
    )?);
    let shared_config = Arc::new(config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loop_handles = Vec::new();

    if config.disable_background_loops {
        info!("Background loops disabled");
    } else {
        let provisioner = Provisioner::new(
            db.clone(),
            controller.clone(),
            agents.clone(),
            shared_config.clone(),
        );
        let scaler = Scaler::new(
            db.clone(),
            controller.clone(),
            provisioner,
            shared_config.clone(),
        );
        let reconciler = Reconciler::new(
            db.clone(),
            controller.clone(),
            agents.clone(),
            shared_config.clone(),
        );
        let gc = GarbageCollector::new(
            db.clone(),
            controller.clone(),
            agents.clone(),
            shared_config.clone(),
        );

        let rx = shutdown_rx.clone();
        loop_handles.push(tokio::spawn(async move { scaler.run(rx).await }));
        let rx = shutdown_rx.clone();
        loop_handles.push(tokio::spawn(async move { reconciler.run(rx).await }));
        let rx = shutdown_rx.clone();
        loop_handles.push(tokio::spawn(async move { gc.run(rx).await }));
    }

    let state = AppState::new(db, config.clone(), metrics_handle);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Loops finish their current iteration and exit; outstanding
    // TERMINATING leases simply resume on next startup.
    info!("Shutting down control loops");
    let _ = shutdown_tx.send(true);
    for handle in loop_handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
