//! Audit trail types (C5, spec.md §4.5). Every request that clears auth and
//! parsing produces exactly one row at creation (`decision` set, resolution
//! fields null); ASK requests and executions fill the resolution fields in
//! a later, single update. Rows are append-only — never deleted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::RequestId;
use super::policy::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Denied,
    TimedOut,
    Executed,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Approved => "approved",
            Resolution::Denied => "denied",
            Resolution::TimedOut => "timed_out",
            Resolution::Executed => "executed",
        }
    }
}

/// A single audit row (spec.md §3 "Audit Entry"). `decision` is set once at
/// creation; `resolution`/`resolved_by`/`resolved_at`/`execution_result`
/// start null and are filled by exactly one later update for ASK and ALLOW
/// flows (plain policy DENY never gets a resolution — `decision` alone is
/// its terminal state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: RequestId,
    pub timestamp: f64,
    pub tool_name: String,
    pub args: Map<String, Value>,
    pub signature: String,
    pub decision: Decision,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<f64>,
    pub execution_result: Option<Value>,
}

impl AuditEntry {
    pub fn new_initial(
        request_id: RequestId,
        timestamp: f64,
        tool_name: String,
        args: Map<String, Value>,
        signature: String,
        decision: Decision,
    ) -> Self {
        Self {
            request_id,
            timestamp,
            tool_name,
            args,
            signature,
            decision,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            execution_result: None,
        }
    }
}
