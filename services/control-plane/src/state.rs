//! Application state shared across request handlers.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::db::Database;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor. The
/// store is the only authoritative state; everything else here is
/// configuration and the metrics render handle.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    config: Config,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(db: Database, config: Config, metrics: PrometheusHandle) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                config,
                metrics,
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.inner.metrics
    }
}
