//! Host persistence.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::DbError;
use crate::host::{Host, Platform};

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn encode_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

struct HostRow(Host);

impl<'r> sqlx::FromRow<'r, SqliteRow> for HostRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let supported_accels: String = row.try_get("supported_accels")?;
        let labels: String = row.try_get("labels")?;
        let active_vm_ids: String = row.try_get("active_vm_ids")?;
        Ok(Self(Host {
            host_id: row.try_get("host_id")?,
            enabled: row.try_get("enabled")?,
            bootstrap_token_hash: row.try_get("bootstrap_token_hash")?,
            session_token_hash: row.try_get("session_token_hash")?,
            session_expires_at: row.try_get("session_expires_at")?,
            agent_url: row.try_get("agent_url")?,
            platform: Platform {
                os_family: row.try_get("os_family")?,
                os_flavor: row.try_get("os_flavor")?,
                os_version: row.try_get("os_version")?,
                cpu_arch: row.try_get("cpu_arch")?,
                selected_accel: row.try_get("selected_accel")?,
                supported_accels: decode_list(&supported_accels),
            },
            labels: decode_list(&labels),
            cpu_total: row.try_get("cpu_total")?,
            cpu_free: row.try_get("cpu_free")?,
            ram_total_mb: row.try_get("ram_total_mb")?,
            ram_free_mb: row.try_get("ram_free_mb")?,
            io_pressure: row.try_get("io_pressure")?,
            active_vm_ids: decode_list(&active_vm_ids),
            last_seen: row.try_get("last_seen")?,
        }))
    }
}

const SELECT_HOST: &str = r#"
SELECT host_id, enabled, bootstrap_token_hash, session_token_hash, session_expires_at,
       agent_url, os_family, os_flavor, os_version, cpu_arch, selected_accel,
       supported_accels, labels, cpu_total, cpu_free, ram_total_mb, ram_free_mb,
       io_pressure, active_vm_ids, last_seen
FROM hosts
"#;

/// What a registration request carries besides credentials.
#[derive(Debug, Clone)]
pub struct Registration {
    pub platform: Platform,
    pub labels: Vec<String>,
    pub agent_url: String,
    pub cpu_total: i64,
    pub ram_total_mb: i64,
}

#[derive(Clone)]
pub struct HostStore {
    pool: SqlitePool,
}

impl HostStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Operator provisioning: create the host row with its bootstrap token
    /// hash. Re-provisioning an existing host replaces the token.
    pub async fn provision(
        &self,
        host_id: &str,
        bootstrap_token_hash: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO hosts (host_id, enabled, bootstrap_token_hash)
            VALUES ($1, 1, $2)
            ON CONFLICT (host_id)
            DO UPDATE SET bootstrap_token_hash = excluded.bootstrap_token_hash
            "#,
        )
        .bind(host_id)
        .bind(bootstrap_token_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Swap the bootstrap credential for a session: store the session token
    /// hash and expiry, absorb the platform tuple and declared capacity.
    pub async fn complete_registration(
        &self,
        host_id: &str,
        session_token_hash: &str,
        session_expires_at: DateTime<Utc>,
        reg: &Registration,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE hosts
            SET session_token_hash = $1,
                session_expires_at = $2,
                agent_url = $3,
                os_family = $4,
                os_flavor = $5,
                os_version = $6,
                cpu_arch = $7,
                selected_accel = $8,
                supported_accels = $9,
                labels = $10,
                cpu_total = $11,
                cpu_free = $11,
                ram_total_mb = $12,
                ram_free_mb = $12,
                last_seen = $13
            WHERE host_id = $14
            "#,
        )
        .bind(session_token_hash)
        .bind(session_expires_at)
        .bind(&reg.agent_url)
        .bind(&reg.platform.os_family)
        .bind(&reg.platform.os_flavor)
        .bind(&reg.platform.os_version)
        .bind(&reg.platform.cpu_arch)
        .bind(&reg.platform.selected_accel)
        .bind(encode_list(&reg.platform.supported_accels))
        .bind(encode_list(&reg.labels))
        .bind(reg.cpu_total)
        .bind(reg.ram_total_mb)
        .bind(Utc::now())
        .bind(host_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Absorb a heartbeat: capacity snapshot, declared VM inventory, and
    /// freshness.
    pub async fn record_heartbeat(
        &self,
        host_id: &str,
        cpu_free: i64,
        ram_free_mb: i64,
        io_pressure: f64,
        active_vm_ids: &[String],
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE hosts
            SET cpu_free = $1, ram_free_mb = $2, io_pressure = $3,
                active_vm_ids = $4, last_seen = $5
            WHERE host_id = $6
            "#,
        )
        .bind(cpu_free)
        .bind(ram_free_mb)
        .bind(io_pressure)
        .bind(encode_list(active_vm_ids))
        .bind(Utc::now())
        .bind(host_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enable or disable a host. Disabling also drops the session so a
    /// re-enabled host must register again; running leases are untouched.
    pub async fn set_enabled(&self, host_id: &str, enabled: bool) -> Result<bool, DbError> {
        let result = if enabled {
            sqlx::query("UPDATE hosts SET enabled = 1 WHERE host_id = $1")
                .bind(host_id)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query(
                r#"
                UPDATE hosts
                SET enabled = 0, session_token_hash = NULL, session_expires_at = NULL
                WHERE host_id = $1
                "#,
            )
            .bind(host_id)
            .execute(&self.pool)
            .await?
        };
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, host_id: &str) -> Result<Option<Host>, DbError> {
        let row = sqlx::query_as::<_, HostRow>(&format!("{SELECT_HOST} WHERE host_id = $1"))
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn list(&self) -> Result<Vec<Host>, DbError> {
        let rows = sqlx::query_as::<_, HostRow>(&format!("{SELECT_HOST} ORDER BY host_id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
