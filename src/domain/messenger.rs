//! The guardian-notification seam (C6, spec.md §4.6): sending an approval
//! prompt out to whatever channel a human watches, and turning that
//! channel's own callback shape into an [`ApprovalResult`].
//!
//! Mirrors the shape of the teacher's `EnvelopeVerifier` trait seam in
//! `domain::smcp_session` — a narrow trait owned by the domain, implemented
//! under `infrastructure`, wired in at construction time rather than
//! registered at runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::approval::ApprovalAction;
use super::ids::RequestId;

/// What gets sent to the guardian channel for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub request_id: RequestId,
    pub tool_name: String,
    pub signature: String,
    pub expires_at: f64,
}

/// The guardian's raw tap, before it is turned into an `ApprovalResult` by
/// attaching a timestamp (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalChoice {
    pub request_id: RequestId,
    pub action: ApprovalAction,
    pub user_id: String,
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("messenger transport error: {0}")]
    Transport(String),
    #[error("messenger returned malformed payload: {0}")]
    Malformed(String),
}

/// Delivers an approval prompt out to a human-facing channel. Implemented
/// under `infrastructure::messenger` for the webhook/logging backends.
#[async_trait]
pub trait MessengerAdapter: Send + Sync {
    async fn send_prompt(&self, prompt: &ApprovalPrompt) -> Result<(), MessengerError>;

    /// Best-effort liveness probe folded into `Gateway::health_status`
    /// (spec.md §4.6 `HealthCheck() -> bool`). Must never raise.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Resolves a guardian's inbound tap against the coordinator. Implemented
/// by `application::coordinator::ApprovalCoordinator` and handed to
/// infrastructure-side webhook receivers so they never touch coordinator
/// internals directly.
#[async_trait]
pub trait ApprovalResolver: Send + Sync {
    async fn resolve(&self, choice: ApprovalChoice) -> bool;
}
