//! Database layer for the control plane.
//!
//! This module provides:
//! - Connection pool management (SQLite, single writer)
//! - Lease CAS transitions coupled with event insertion
//! - Host rows and the append-only event log
//!
//! The store is the only shared state between the control loops; all
//! cross-loop coordination happens through conditional updates here.

mod error;
mod events;
mod hosts;
mod leases;

pub use error::DbError;
pub use events::{EventRow, EventStore};
pub use hosts::{HostStore, Registration};
pub use leases::{AdmissionCaps, LeaseFilter, LeaseStore};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Database connection wrapper.
///
/// The pool is capped at one connection: SQLite already serialises writers,
/// and a single connection keeps every transaction strictly ordered while
/// WAL mode lets ad-hoc readers (sqlite3 CLI, backups) proceed.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(DbError::Connect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(DbError::Connect)?;

        info!(database_url, "Database connection established");
        Ok(Self { pool })
    }

    /// Run embedded migrations. A checksum mismatch against an existing
    /// schema is fatal: we refuse to run on a store we do not understand.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn leases(&self) -> LeaseStore {
        LeaseStore::new(self.pool.clone())
    }

    pub fn hosts(&self) -> HostStore {
        HostStore::new(self.pool.clone())
    }

    pub fn events(&self) -> EventStore {
        EventStore::new(self.pool.clone())
    }
}
