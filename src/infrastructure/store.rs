//! SQLite-backed durable store (C4, spec.md §4.4), grounded on
//! `original_source/src/agentpass/db.py`'s schema and query shapes. Uses
//! runtime `sqlx::query`/`query_as` rather than the compile-time `query!`
//! macro, the same choice the teacher makes in
//! `infrastructure/repositories/postgres_execution.rs`, since there is no
//! live database available to verify macro queries against at build time.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::domain::approval::PendingRow;
use crate::domain::audit::{AuditEntry, Resolution};
use crate::domain::ids::RequestId;
use crate::domain::store::{ApprovalStore, StoreError};

/// Epoch seconds (the in-memory representation, spec.md §4.4: "epoch floats
/// in memory") to an ISO-8601 UTC string at second resolution (the on-disk
/// representation: "persisted as ISO-8601 UTC strings with second
/// resolution"). Fixed-width, zero-padded, `Z`-suffixed output sorts
/// lexicographically in the same order as chronologically, so `expires_at <=
/// ?` range queries keep working unchanged against the TEXT column.
fn epoch_to_iso(epoch: f64) -> String {
    let secs = epoch.floor() as i64;
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Inverse of [`epoch_to_iso`]. Round-trip tolerance is the sub-second part
/// lost by truncating to second resolution on write (spec.md §4.4: "round-
/// trip tolerance is <= 1 s").
fn iso_to_epoch(s: &str) -> Result<f64, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp() as f64)
        .map_err(|e| StoreError::Backend(format!("invalid ISO-8601 timestamp '{s}': {e}")))
}

/// A single open connection is deliberately enforced: every write here is
/// small and the table is tiny, so serializing through one connection is
/// simpler than coordinating SQLite's own locking across a pool, and it
/// gives "DB writes share a single serialized connection" (spec.md §5) for
/// free.
const MAX_CONNECTIONS: u32 = 1;

pub struct SqliteApprovalStore {
    pool: SqlitePool,
}

impl SqliteApprovalStore {
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        // `SqliteConnectOptions::new().filename(path)` takes the path
        // directly rather than through a `sqlite://` URL, so a relative
        // `storage.path` (e.g. `wardengate.db`) opens the intended file
        // instead of being parsed as a URL authority.
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        store.harden_permissions(path)?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_approvals (
                request_id  TEXT PRIMARY KEY,
                tool_name   TEXT NOT NULL,
                args        TEXT NOT NULL,
                signature   TEXT NOT NULL,
                message_id  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                result      TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pending_expires_at ON pending_approvals (expires_at)")
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id        TEXT NOT NULL,
                timestamp         TEXT NOT NULL,
                tool_name         TEXT NOT NULL,
                args              TEXT NOT NULL,
                signature         TEXT NOT NULL,
                decision          TEXT NOT NULL,
                resolution        TEXT,
                resolved_by       TEXT,
                resolved_at       TEXT,
                execution_result  TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp)")
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_tool_name ON audit_log (tool_name)")
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

        Ok(())
    }

    #[cfg(unix)]
    fn harden_permissions(&self, path: &Path) -> Result<(), StoreError> {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms).map_err(sql_err_io)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn harden_permissions(&self, _path: &Path) -> Result<(), StoreError> {
        Ok(())
    }
}

fn sql_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(unix)]
fn sql_err_io(e: std::io::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decision_to_str(d: crate::domain::policy::Decision) -> &'static str {
    match d {
        crate::domain::policy::Decision::Allow => "allow",
        crate::domain::policy::Decision::Deny => "deny",
        crate::domain::policy::Decision::Ask => "ask",
    }
}

fn decision_from_str(s: &str) -> crate::domain::policy::Decision {
    match s {
        "allow" => crate::domain::policy::Decision::Allow,
        "deny" => crate::domain::policy::Decision::Deny,
        _ => crate::domain::policy::Decision::Ask,
    }
}

fn resolution_to_str(r: Resolution) -> &'static str {
    r.as_str()
}

fn resolution_from_str(s: &str) -> Resolution {
    match s {
        "approved" => Resolution::Approved,
        "denied" => Resolution::Denied,
        "timed_out" => Resolution::TimedOut,
        _ => Resolution::Executed,
    }
}

fn pending_row_from_sql(row: sqlx::sqlite::SqliteRow) -> Result<PendingRow, StoreError> {
    let request_id: String = row.try_get("request_id").map_err(sql_err)?;
    let args: String = row.try_get("args").map_err(sql_err)?;
    let created_at: String = row.try_get("created_at").map_err(sql_err)?;
    let expires_at: String = row.try_get("expires_at").map_err(sql_err)?;
    Ok(PendingRow {
        request_id: RequestId::from_str(&request_id).map_err(|e| StoreError::Backend(e.to_string()))?,
        tool_name: row.try_get("tool_name").map_err(sql_err)?,
        args: serde_json::from_str(&args).map_err(|e| StoreError::Backend(e.to_string()))?,
        signature: row.try_get("signature").map_err(sql_err)?,
        message_id: row.try_get("message_id").map_err(sql_err)?,
        created_at: iso_to_epoch(&created_at)?,
        expires_at: iso_to_epoch(&expires_at)?,
        result: row.try_get("result").map_err(sql_err)?,
    })
}

fn audit_entry_from_sql(row: sqlx::sqlite::SqliteRow) -> Result<AuditEntry, StoreError> {
    let request_id: String = row.try_get("request_id").map_err(sql_err)?;
    let args: String = row.try_get("args").map_err(sql_err)?;
    let decision: String = row.try_get("decision").map_err(sql_err)?;
    let resolution: Option<String> = row.try_get("resolution").map_err(sql_err)?;
    let execution_result: Option<String> = row.try_get("execution_result").map_err(sql_err)?;
    let timestamp: String = row.try_get("timestamp").map_err(sql_err)?;
    let resolved_at: Option<String> = row.try_get("resolved_at").map_err(sql_err)?;
    Ok(AuditEntry {
        request_id: RequestId::from_str(&request_id).map_err(|e| StoreError::Backend(e.to_string()))?,
        timestamp: iso_to_epoch(&timestamp)?,
        tool_name: row.try_get("tool_name").map_err(sql_err)?,
        args: match serde_json::from_str(&args).map_err(|e| StoreError::Backend(e.to_string()))? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
        signature: row.try_get("signature").map_err(sql_err)?,
        decision: decision_from_str(&decision),
        resolution: resolution.as_deref().map(resolution_from_str),
        resolved_by: row.try_get("resolved_by").map_err(sql_err)?,
        resolved_at: resolved_at.as_deref().map(iso_to_epoch).transpose()?,
        execution_result: execution_result
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
    })
}

#[async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn save_pending(&self, row: &PendingRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_approvals
                (request_id, tool_name, args, signature, message_id, created_at, expires_at, result)
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(row.request_id.to_string())
        .bind(&row.tool_name)
        .bind(row.args.to_string())
        .bind(&row.signature)
        .bind(&row.message_id)
        .bind(epoch_to_iso(row.created_at))
        .bind(epoch_to_iso(row.expires_at))
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn load_pending(&self, id: RequestId) -> Result<Option<PendingRow>, StoreError> {
        let row = sqlx::query(
            "SELECT request_id, tool_name, args, signature, message_id, created_at, expires_at, result
             FROM pending_approvals WHERE request_id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        row.map(pending_row_from_sql).transpose()
    }

    async fn delete_pending(&self, id: RequestId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_approvals WHERE request_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn mark_resolved(&self, id: RequestId, result_json: &str) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            "UPDATE pending_approvals SET result = ? WHERE request_id = ? AND result IS NULL",
        )
        .bind(result_json)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn take_unclaimed_results(&self) -> Result<Vec<PendingRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        let rows = sqlx::query(
            "SELECT request_id, tool_name, args, signature, message_id, created_at, expires_at, result
             FROM pending_approvals WHERE result IS NOT NULL",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("request_id").map_err(sql_err)?;
            sqlx::query("DELETE FROM pending_approvals WHERE request_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
            results.push(pending_row_from_sql(row)?);
        }

        tx.commit().await.map_err(sql_err)?;
        Ok(results)
    }

    async fn count_unresolved(&self) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_approvals WHERE result IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(sql_err)?;
        let n: i64 = row.try_get("n").map_err(sql_err)?;
        Ok(n as u32)
    }

    async fn cleanup_stale(&self, now: f64) -> Result<Vec<PendingRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        let rows = sqlx::query(
            "SELECT request_id, tool_name, args, signature, message_id, created_at, expires_at, result
             FROM pending_approvals WHERE expires_at <= ?",
        )
        .bind(epoch_to_iso(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;

        let mut deleted = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("request_id").map_err(sql_err)?;
            sqlx::query("DELETE FROM pending_approvals WHERE request_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
            deleted.push(pending_row_from_sql(row)?);
        }

        tx.commit().await.map_err(sql_err)?;
        Ok(deleted)
    }

    async fn log_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log
                (request_id, timestamp, tool_name, args, signature, decision,
                 resolution, resolved_by, resolved_at, execution_result)
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL)",
        )
        .bind(entry.request_id.to_string())
        .bind(epoch_to_iso(entry.timestamp))
        .bind(&entry.tool_name)
        .bind(Value::Object(entry.args.clone()).to_string())
        .bind(&entry.signature)
        .bind(decision_to_str(entry.decision))
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn update_audit_resolution(
        &self,
        id: RequestId,
        resolution: Resolution,
        resolved_by: Option<String>,
        resolved_at: f64,
        execution_result: Option<Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE audit_log SET resolution = ?, resolved_by = ?, resolved_at = ?, execution_result = ?
             WHERE request_id = ? AND resolution IS NULL",
        )
        .bind(resolution_to_str(resolution))
        .bind(resolved_by)
        .bind(epoch_to_iso(resolved_at))
        .bind(execution_result.map(|v| v.to_string()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_audit_log(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT request_id, timestamp, tool_name, args, signature, decision,
                    resolution, resolved_by, resolved_at, execution_result
             FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.into_iter().map(audit_entry_from_sql).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::store::ApprovalStore as _;
    use serde_json::json;
    use tempfile::tempdir;

    async fn store() -> (SqliteApprovalStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wardengate.db");
        let store = SqliteApprovalStore::connect(&path).await.unwrap();
        (store, dir)
    }

    fn sample_row(id: RequestId) -> PendingRow {
        PendingRow {
            request_id: id,
            tool_name: "ha_call_service".to_string(),
            args: json!({"entity_id": "light.kitchen"}),
            signature: "ha_call_service(light.kitchen)".to_string(),
            message_id: "msg-1".to_string(),
            created_at: 1000.0,
            expires_at: 1300.0,
            result: None,
        }
    }

    fn sample_audit(id: RequestId, decision: crate::domain::policy::Decision) -> AuditEntry {
        AuditEntry::new_initial(
            id,
            1000.0,
            "ha_call_service".to_string(),
            serde_json::Map::new(),
            "ha_call_service(light.kitchen)".to_string(),
            decision,
        )
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (store, _dir) = store().await;
        let id = RequestId::new();
        store.save_pending(&sample_row(id)).await.unwrap();
        let loaded = store.load_pending(id).await.unwrap().unwrap();
        assert_eq!(loaded.signature, "ha_call_service(light.kitchen)");
    }

    #[tokio::test]
    async fn mark_resolved_is_write_once() {
        let (store, _dir) = store().await;
        let id = RequestId::new();
        store.save_pending(&sample_row(id)).await.unwrap();
        assert!(store.mark_resolved(id, "{\"status\":\"executed\",\"data\":1}").await.unwrap());
        assert!(!store.mark_resolved(id, "{\"status\":\"denied\",\"data\":2}").await.unwrap());
    }

    #[tokio::test]
    async fn unclaimed_results_are_returned_and_deleted_once() {
        let (store, _dir) = store().await;
        let id = RequestId::new();
        store.save_pending(&sample_row(id)).await.unwrap();
        store.mark_resolved(id, "{\"status\":\"executed\",\"data\":1}").await.unwrap();
        let first = store.take_unclaimed_results().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.take_unclaimed_results().await.unwrap();
        assert!(second.is_empty());
        assert!(store.load_pending(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_stale_deletes_only_expired_rows() {
        let (store, _dir) = store().await;
        let expired = RequestId::new();
        let fresh = RequestId::new();
        store.save_pending(&sample_row(expired)).await.unwrap();
        let mut fresh_row = sample_row(fresh);
        fresh_row.expires_at = 9_999_999_999.0;
        store.save_pending(&fresh_row).await.unwrap();

        let deleted = store.cleanup_stale(2000.0).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].request_id, expired);
        assert!(store.load_pending(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn audit_log_orders_newest_first_and_resolution_is_write_once() {
        let (store, _dir) = store().await;
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        store.log_audit(&sample_audit(id1, crate::domain::policy::Decision::Ask)).await.unwrap();
        store.log_audit(&sample_audit(id2, crate::domain::policy::Decision::Allow)).await.unwrap();

        store
            .update_audit_resolution(id1, Resolution::Approved, Some("alice".into()), 1100.0, None)
            .await
            .unwrap();
        // A second attempt must not overwrite the first resolution.
        store
            .update_audit_resolution(id1, Resolution::Denied, Some("mallory".into()), 1200.0, None)
            .await
            .unwrap();

        let log = store.get_audit_log(10).await.unwrap();
        assert_eq!(log[0].request_id, id2);
        assert_eq!(log[1].request_id, id1);
        assert_eq!(log[1].resolution, Some(Resolution::Approved));
        assert_eq!(log[1].resolved_by.as_deref(), Some("alice"));
    }
}
