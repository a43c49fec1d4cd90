//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A live lease already holds this vm_id or controller node name.
    #[error("duplicate {0} among live leases")]
    Conflict(&'static str),

    /// An admission cap would be exceeded; checked inside the insert
    /// transaction so concurrent loops cannot race past it.
    #[error("admission cap reached: {0}")]
    CapExceeded(&'static str),
}
