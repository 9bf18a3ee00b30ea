//! The durable-storage seam (C4, spec.md §4.4): persisting pending
//! approvals and the audit trail so both survive a gateway restart.
//! Implemented by `infrastructure::store::SqliteApprovalStore`, grounded on
//! `original_source/src/agentpass/db.py`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::approval::PendingRow;
use super::audit::{AuditEntry, Resolution};
use super::ids::RequestId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("no pending row for request {0}")]
    NotFound(RequestId),
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn save_pending(&self, row: &PendingRow) -> Result<(), StoreError>;

    async fn load_pending(&self, id: RequestId) -> Result<Option<PendingRow>, StoreError>;

    async fn delete_pending(&self, id: RequestId) -> Result<(), StoreError>;

    /// Write the JSON-encoded `{status, data}` outcome into a pending row's
    /// `result` column, for offline (disconnected-agent) delivery. Returns
    /// `false` if the row was already resolved — `result` is write-once
    /// (spec.md §3 invariants: "null -> populated").
    async fn mark_resolved(&self, id: RequestId, result_json: &str) -> Result<bool, StoreError>;

    /// Rows whose `result` is populated, deleted in the same call so a
    /// later `get_pending_results` round trip never redelivers them
    /// (spec.md §4.9: "return all rows where result IS NOT NULL, then
    /// delete those rows").
    async fn take_unclaimed_results(&self) -> Result<Vec<PendingRow>, StoreError>;

    /// Count of rows still awaiting any resolution, for health reporting —
    /// must not mutate or claim anything.
    async fn count_unresolved(&self) -> Result<u32, StoreError>;

    /// Deletes rows whose `expires_at` has passed without ever resolving,
    /// returning the deleted rows (spec.md §4.4 "CleanupStale"). Run once
    /// at startup as crash recovery.
    async fn cleanup_stale(&self, now: f64) -> Result<Vec<PendingRow>, StoreError>;

    /// Initial audit row at decision time — `decision` set, every
    /// resolution field null (spec.md §4.5).
    async fn log_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// The one later update that fills `resolution`/`resolved_by`/
    /// `resolved_at`/`execution_result` — applied at most once per row
    /// (spec.md §3 invariant: "resolution columns transition from null to
    /// terminal exactly once").
    #[allow(clippy::too_many_arguments)]
    async fn update_audit_resolution(
        &self,
        id: RequestId,
        resolution: Resolution,
        resolved_by: Option<String>,
        resolved_at: f64,
        execution_result: Option<Value>,
    ) -> Result<(), StoreError>;

    async fn get_audit_log(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError>;
}
