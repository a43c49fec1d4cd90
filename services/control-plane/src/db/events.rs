//! Append-only event log.
//!
//! Events are the diagnostic record of every state transition and external
//! call outcome. Transition events are written by `LeaseStore` inside the
//! same transaction as the state change; standalone events (host lifecycle,
//! scaler decisions) go through [`EventStore::append`]. Retention is a ring
//! bounded by `EVENT_RETENTION`, enforced by the GC.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::DbError;

/// One row of the event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub lease_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for EventRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let payload_raw: String = row.try_get("payload")?;
        Ok(Self {
            id: row.try_get("id")?,
            timestamp: row.try_get("timestamp")?,
            lease_id: row.try_get("lease_id")?,
            event_type: row.try_get("event_type")?,
            payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Insert one event on any executor (pool or open transaction).
pub(crate) async fn insert_event<'e, E>(
    executor: E,
    lease_id: Option<&str>,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO events (timestamp, lease_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(Utc::now())
    .bind(lease_id)
    .bind(event_type)
    .bind(payload.to_string())
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a standalone event (not coupled to a lease transition).
    pub async fn append(
        &self,
        event_type: &str,
        lease_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<(), DbError> {
        insert_event(&self.pool, lease_id, event_type, &payload).await?;
        Ok(())
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<EventRow>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, timestamp, lease_id, event_type, payload FROM events ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Events for one lease in insertion order.
    pub async fn for_lease(&self, lease_id: &str) -> Result<Vec<EventRow>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, timestamp, lease_id, event_type, payload FROM events WHERE lease_id = $1 ORDER BY id",
        )
        .bind(lease_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop everything but the newest `retain` events.
    pub async fn prune(&self, retain: i64) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM events
            WHERE id <= (SELECT COALESCE(MAX(id), 0) FROM events) - $1
            "#,
        )
        .bind(retain)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
