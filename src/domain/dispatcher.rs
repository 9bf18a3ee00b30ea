//! The service-dispatch seam (C7, spec.md §4.7): turning an allowed tool
//! request into a call against the backend service it names.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("service '{0}' is not configured")]
    ServiceNotConfigured(String),
    #[error("upstream service error: {0}")]
    Upstream(String),
}

/// Executes a tool call against the service it is registered to, once the
/// request has cleared signature validation and policy evaluation.
#[async_trait]
pub trait ServiceDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        service_name: &str,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, DispatchError>;

    /// Best-effort liveness probe folded into `Gateway::health_status`.
    /// Must never raise; unreachable backends just report `false`.
    async fn health_check(&self) -> bool {
        true
    }
}
