//! Lease persistence and compare-and-swap transitions.
//!
//! Every mutation here is conditional on the lease's current state, so the
//! scaler, reconciler, GC, and API handlers can all act on the same lease
//! without locks: whoever's CAS lands first wins, everyone else observes
//! the miss and yields. The transition event is written in the same
//! transaction as the state change; a rejected transition writes nothing.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::warn;

use super::events::insert_event;
use super::DbError;
use crate::lease::{can_transition, Lease, LeaseState};

/// Filters for lease listings.
#[derive(Debug, Default, Clone)]
pub struct LeaseFilter {
    pub label: Option<String>,
    pub state: Option<LeaseState>,
    pub host_id: Option<String>,
}

/// Admission caps checked inside the create transaction.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionCaps {
    pub global_max_vms: i64,
    pub label_max_inflight: i64,
}

struct LeaseRow(Lease);

impl<'r> sqlx::FromRow<'r, SqliteRow> for LeaseRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let state_raw: String = row.try_get("state")?;
        let state = LeaseState::parse(&state_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "state".into(),
            source: format!("unknown lease state {state_raw:?}").into(),
        })?;
        Ok(Self(Lease {
            lease_id: row.try_get("lease_id")?,
            vm_id: row.try_get("vm_id")?,
            label: row.try_get("label")?,
            controller_node_name: row.try_get("controller_node_name")?,
            state,
            host_id: row.try_get("host_id")?,
            cpu_reserved: row.try_get("cpu_reserved")?,
            ram_reserved_mb: row.try_get("ram_reserved_mb")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            connect_deadline: row.try_get("connect_deadline")?,
            ttl_deadline: row.try_get("ttl_deadline")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            last_error: row.try_get("last_error")?,
        }))
    }
}

const SELECT_LEASE: &str = r#"
SELECT lease_id, vm_id, label, controller_node_name, state, host_id,
       cpu_reserved, ram_reserved_mb, created_at, updated_at,
       connect_deadline, ttl_deadline, last_heartbeat, last_error
FROM leases
"#;

#[derive(Clone)]
pub struct LeaseStore {
    pool: SqlitePool,
}

impl LeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a REQUESTED lease, re-checking the admission caps inside the
    /// transaction. The partial unique indexes on `vm_id` and
    /// `controller_node_name` reject duplicates among live leases.
    pub async fn create_requested(
        &self,
        lease: &Lease,
        caps: AdmissionCaps,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        let total_active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM leases WHERE state NOT IN ('TERMINATED', 'FAILED')",
        )
        .fetch_one(&mut *tx)
        .await?;
        if total_active >= caps.global_max_vms {
            return Err(DbError::CapExceeded("GLOBAL_MAX_VMS"));
        }

        // REQUESTED rows are counted here (unlike the scaler's advisory
        // formula): they become inflight the moment they are placed, and
        // the hard cap must hold even if placement races this insert.
        let inflight: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM leases
            WHERE label = $1 AND state IN ('REQUESTED', 'PROVISIONING', 'BOOTING', 'CONNECTING')
            "#,
        )
        .bind(&lease.label)
        .fetch_one(&mut *tx)
        .await?;
        if inflight >= caps.label_max_inflight {
            return Err(DbError::CapExceeded("LABEL_MAX_INFLIGHT"));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO leases (lease_id, vm_id, label, controller_node_name, state, host_id,
                                cpu_reserved, ram_reserved_mb, created_at, updated_at,
                                connect_deadline, ttl_deadline, last_heartbeat, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL, NULL)
            "#,
        )
        .bind(&lease.lease_id)
        .bind(&lease.vm_id)
        .bind(&lease.label)
        .bind(&lease.controller_node_name)
        .bind(lease.state.as_str())
        .bind(&lease.host_id)
        .bind(lease.cpu_reserved)
        .bind(lease.ram_reserved_mb)
        .bind(lease.created_at)
        .bind(lease.updated_at)
        .bind(lease.connect_deadline)
        .bind(lease.ttl_deadline)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if e.as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false)
            {
                return Err(DbError::Conflict("vm_id or controller_node_name"));
            }
            return Err(e.into());
        }

        insert_event(
            &mut *tx,
            Some(&lease.lease_id),
            "lease.created",
            &serde_json::json!({
                "label": lease.label,
                "vm_id": lease.vm_id,
                "controller_node_name": lease.controller_node_name,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Compare-and-swap the lease state and record the transition event in
    /// one transaction. Returns `false` (with nothing written) when the
    /// lease is not currently in `from` or the move is illegal.
    pub async fn transition(
        &self,
        lease_id: &str,
        from: LeaseState,
        to: LeaseState,
        event_type: &str,
        payload: serde_json::Value,
        last_error: Option<&str>,
    ) -> Result<bool, DbError> {
        if !can_transition(from, to) {
            warn!(lease_id, %from, %to, "refusing illegal lease transition");
            return Ok(false);
        }
        self.transition_inner(lease_id, from, to, event_type, payload, last_error, None)
            .await
    }

    /// REQUESTED -> PROVISIONING, additionally binding the lease to a host.
    pub async fn place(
        &self,
        lease_id: &str,
        host_id: &str,
        payload: serde_json::Value,
    ) -> Result<bool, DbError> {
        self.transition_inner(
            lease_id,
            LeaseState::Requested,
            LeaseState::Provisioning,
            "lease.provisioning",
            payload,
            None,
            Some(host_id),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition_inner(
        &self,
        lease_id: &str,
        from: LeaseState,
        to: LeaseState,
        event_type: &str,
        payload: serde_json::Value,
        last_error: Option<&str>,
        host_id: Option<&str>,
    ) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE leases
            SET state = $1,
                updated_at = $2,
                last_error = COALESCE($3, last_error),
                host_id = COALESCE($4, host_id)
            WHERE lease_id = $5 AND state = $6
            "#,
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(last_error)
        .bind(host_id)
        .bind(lease_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        let mut event_payload = payload;
        if let serde_json::Value::Object(map) = &mut event_payload {
            map.insert("from".into(), from.as_str().into());
            map.insert("to".into(), to.as_str().into());
        }
        insert_event(&mut *tx, Some(lease_id), event_type, &event_payload).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Force a live lease to TERMINATING from whatever state it is in.
    /// Idempotent: leases already TERMINATING or terminal are left alone.
    pub async fn force_terminating(
        &self,
        lease_id: &str,
        event_type: &str,
        reason: &str,
    ) -> Result<bool, DbError> {
        // Read-then-CAS: a concurrent transition makes the CAS miss and we
        // simply report no change.
        let Some(lease) = self.get(lease_id).await? else {
            return Ok(false);
        };
        if lease.state.is_terminal() || lease.state == LeaseState::Terminating {
            return Ok(false);
        }
        self.transition(
            lease_id,
            lease.state,
            LeaseState::Terminating,
            event_type,
            serde_json::json!({ "reason": reason, "host_id": lease.host_id }),
            Some(reason),
        )
        .await
    }

    /// Record a controller-side liveness observation.
    pub async fn touch_heartbeat(&self, lease_id: &str, when: DateTime<Utc>) -> Result<(), DbError> {
        sqlx::query("UPDATE leases SET last_heartbeat = $1 WHERE lease_id = $2")
            .bind(when)
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, lease_id: &str) -> Result<Option<Lease>, DbError> {
        let row = sqlx::query_as::<_, LeaseRow>(&format!("{SELECT_LEASE} WHERE lease_id = $1"))
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    /// The live lease owning `vm_id`, if any.
    pub async fn get_live_by_vm(&self, vm_id: &str) -> Result<Option<Lease>, DbError> {
        let row = sqlx::query_as::<_, LeaseRow>(&format!(
            "{SELECT_LEASE} WHERE vm_id = $1 AND state NOT IN ('TERMINATED', 'FAILED')"
        ))
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn list(&self, filter: &LeaseFilter) -> Result<Vec<Lease>, DbError> {
        let sql = format!(
            r#"{SELECT_LEASE}
            WHERE ($1 IS NULL OR label = $1)
              AND ($2 IS NULL OR state = $2)
              AND ($3 IS NULL OR host_id = $3)
            ORDER BY created_at DESC
            "#
        );
        let rows = sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(filter.label.as_deref())
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.host_id.as_deref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn list_non_terminal(&self) -> Result<Vec<Lease>, DbError> {
        let rows = sqlx::query_as::<_, LeaseRow>(&format!(
            "{SELECT_LEASE} WHERE state NOT IN ('TERMINATED', 'FAILED') ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn count_non_terminal(&self) -> Result<i64, DbError> {
        let n = sqlx::query_scalar(
            "SELECT COUNT(*) FROM leases WHERE state NOT IN ('TERMINATED', 'FAILED')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Leases in PROVISIONING, BOOTING, or CONNECTING for a label.
    pub async fn count_inflight(&self, label: &str) -> Result<i64, DbError> {
        let n = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM leases
            WHERE label = $1 AND state IN ('PROVISIONING', 'BOOTING', 'CONNECTING')
            "#,
        )
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    pub async fn counts_by_state(&self) -> Result<HashMap<LeaseState, i64>, DbError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM leases GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = HashMap::new();
        for (raw, n) in rows {
            if let Some(state) = LeaseState::parse(&raw) {
                counts.insert(state, n);
            }
        }
        Ok(counts)
    }
}
