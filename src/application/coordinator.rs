//! Approval coordinator (C8, spec.md §4.8): owns the in-memory
//! `RequestId -> Waiter<ApprovalResult>` table, mediates between the
//! messenger (outbound prompts, inbound taps) and the durable store, and
//! implements at-most-once resolution whether the tap arrives while the
//! agent is connected or after it has detached.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::domain::approval::{ApprovalAction, ApprovalResult, PendingRow, Waiter};
use crate::domain::audit::Resolution;
use crate::domain::dispatcher::ServiceDispatcher;
use crate::domain::ids::RequestId;
use crate::domain::messenger::{ApprovalChoice, ApprovalPrompt, ApprovalResolver, MessengerAdapter};
use crate::domain::store::{ApprovalStore, StoreError};
use crate::domain::tool::{ToolLookup, ToolRequest};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("messenger failed to deliver prompt: {0}")]
    Messenger(#[from] crate::domain::messenger::MessengerError),
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Live coordinator state. Cheaply cloneable — every clone shares the same
/// waiter table, store, messenger, dispatcher, and registry behind `Arc`.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    waiters: Arc<DashMap<RequestId, Waiter<ApprovalResult>>>,
    store: Arc<dyn ApprovalStore>,
    messenger: Arc<dyn MessengerAdapter>,
    dispatcher: Arc<dyn ServiceDispatcher>,
    registry: Arc<dyn ToolLookup>,
    /// Serializes resolve-vs-timeout races so exactly one writer ever
    /// completes a given request's waiter (spec.md §5 "_resolve_lock").
    resolve_lock: Arc<Mutex<()>>,
    approval_ttl: Duration,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        messenger: Arc<dyn MessengerAdapter>,
        dispatcher: Arc<dyn ServiceDispatcher>,
        registry: Arc<dyn ToolLookup>,
        approval_ttl: Duration,
    ) -> Self {
        Self {
            waiters: Arc::new(DashMap::new()),
            store,
            messenger,
            dispatcher,
            registry,
            resolve_lock: Arc::new(Mutex::new(())),
            approval_ttl,
        }
    }

    /// Number of requests still awaiting a guardian decision, for C9's
    /// `max_pending_approvals` admission check (spec.md §4.8, §4.9) and for
    /// health reporting.
    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }

    /// Register a pending approval, persist it, send the prompt, and hand
    /// back a `Waiter` the caller can await with its own timeout. A
    /// background timeout guard race-arms alongside it so a result is
    /// recorded even if nobody ever awaits the waiter again (spec.md §8
    /// "ask-then-timeout").
    pub async fn request(&self, request: &ToolRequest) -> Result<Waiter<ApprovalResult>, CoordinatorError> {
        let created_at = now();
        let expires_at = created_at + self.approval_ttl.as_secs_f64();
        let message_id = request.id.to_string();

        let row = PendingRow {
            request_id: request.id,
            tool_name: request.tool_name.clone(),
            args: Value::Object(request.args.clone()),
            signature: request.signature.clone(),
            message_id: message_id.clone(),
            created_at,
            expires_at,
            result: None,
        };
        // Pending DB row inserted before `SendApproval` is called (spec.md §5).
        self.store.save_pending(&row).await?;

        let waiter: Waiter<ApprovalResult> = Waiter::new();
        self.waiters.insert(request.id, waiter.clone());

        self.messenger
            .send_prompt(&ApprovalPrompt {
                request_id: request.id,
                tool_name: request.tool_name.clone(),
                signature: request.signature.clone(),
                expires_at,
            })
            .await?;

        self.spawn_timeout_guard(request.id, waiter.clone());

        Ok(waiter)
    }

    fn spawn_timeout_guard(&self, request_id: RequestId, waiter: Waiter<ApprovalResult>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if timeout(coordinator.approval_ttl, waiter.wait()).await.is_err() {
                let timeout_result = ApprovalResult {
                    request_id,
                    action: ApprovalAction::Deny,
                    user_id: ApprovalResult::TIMEOUT_USER_ID.to_string(),
                    timestamp: now(),
                };
                coordinator.complete_waiter(request_id, timeout_result).await;
            }
        });
    }

    /// The single path that ever writes into `self.waiters`: under
    /// `resolve_lock`, remove the entry (if still present) and complete its
    /// waiter. A second caller for the same `request_id` — whether the
    /// timeout guard or a human tap — finds nothing left to do (spec.md §8
    /// "at-most-once approval resolution").
    async fn complete_waiter(&self, request_id: RequestId, result: ApprovalResult) {
        let _guard = self.resolve_lock.lock().await;
        let Some((_, waiter)) = self.waiters.remove(&request_id) else {
            return;
        };
        waiter.complete(result).await;
    }

    pub(crate) async fn resolve_choice(&self, choice: ApprovalChoice) -> bool {
        if !self.waiters.contains_key(&choice.request_id) {
            return false;
        }
        let result = ApprovalResult {
            request_id: choice.request_id,
            action: choice.action,
            user_id: choice.user_id,
            timestamp: now(),
        };
        let request_id = result.request_id;
        self.complete_waiter(request_id, result).await;
        info!(%request_id, "approval resolved by guardian");
        true
    }

    /// Hand a request's lifetime to a detached background task once the
    /// connection that created it has gone away while the waiter was still
    /// unfinished (spec.md §4.8 `DetachOnDisconnect`): await the eventual
    /// `ApprovalResult`, execute the tool on allow, and persist whichever
    /// outcome into the pending row's `result` column plus the audit row's
    /// terminal resolution — all exactly once, regardless of how the waiter
    /// came to resolve (human tap, timeout, or `ResolveAll` on shutdown).
    pub fn detach_on_disconnect(&self, request: ToolRequest, waiter: Waiter<ApprovalResult>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let result = waiter.wait().await;
            coordinator.finish_detached(request, result).await;
        });
    }

    async fn finish_detached(&self, request: ToolRequest, result: ApprovalResult) {
        let resolution = if result.is_timeout() {
            Resolution::TimedOut
        } else {
            match result.action {
                ApprovalAction::Allow => Resolution::Approved,
                ApprovalAction::Deny => Resolution::Denied,
            }
        };

        let (status, data, execution_result): (&str, Value, Option<Value>) = match result.action {
            ApprovalAction::Allow => {
                let service_name = self.registry.get_service_name(&request.tool_name).map(str::to_string);
                match service_name {
                    Some(service_name) => {
                        match self.dispatcher.dispatch(&service_name, &request.tool_name, &request.args).await {
                            Ok(value) => ("executed", value.clone(), Some(value)),
                            Err(err) => ("error", json!(err.to_string()), None),
                        }
                    }
                    None => ("error", json!(format!("unknown tool: {}", request.tool_name)), None),
                }
            }
            ApprovalAction::Deny => ("denied", json!(result.user_id.clone()), None),
        };

        let payload = json!({"status": status, "data": data}).to_string();
        if let Err(err) = self.store.mark_resolved(request.id, &payload).await {
            warn!(request_id = %request.id, error = %err, "failed to persist offline approval result");
        }

        if let Err(err) = self
            .store
            .update_audit_resolution(request.id, resolution, Some(result.user_id), result.timestamp, execution_result)
            .await
        {
            warn!(request_id = %request.id, error = %err, "failed to update audit resolution for detached request");
        }
    }

    /// On gateway shutdown, synthesize a `deny` for every still-pending
    /// waiter so no agent (or detached task) hangs forever. No persistence
    /// change is made here — a background `DetachOnDisconnect` task already
    /// awaiting one of these waiters performs its own store write when it
    /// wakes (spec.md §9 Open Question: the in-flight approval itself is not
    /// separately preserved; see `DESIGN.md`).
    pub async fn resolve_all(&self, reason: &str) {
        let pending: Vec<RequestId> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for request_id in pending {
            let result = ApprovalResult {
                request_id,
                action: ApprovalAction::Deny,
                user_id: reason.to_string(),
                timestamp: now(),
            };
            self.complete_waiter(request_id, result).await;
        }
    }

    pub async fn get_audit_log(&self, limit: u32) -> Result<Vec<crate::domain::audit::AuditEntry>, CoordinatorError> {
        Ok(self.store.get_audit_log(limit).await?)
    }

    /// Pending rows that resolved while nobody was connected to receive
    /// them, for delivery on the agent's next `get_pending_results` call
    /// (spec.md §4.4, §8 "disconnect-then-retrieve").
    pub async fn take_unclaimed_results(&self) -> Result<Vec<PendingRow>, CoordinatorError> {
        Ok(self.store.take_unclaimed_results().await?)
    }

    pub async fn count_unresolved(&self) -> Result<u32, CoordinatorError> {
        Ok(self.store.count_unresolved().await?)
    }

    pub async fn cleanup_stale(&self) -> Result<Vec<PendingRow>, CoordinatorError> {
        Ok(self.store.cleanup_stale(now()).await?)
    }

    pub async fn health_check(&self) -> bool {
        self.messenger.health_check().await && self.dispatcher.health_check().await
    }
}

#[async_trait]
impl ApprovalResolver for ApprovalCoordinator {
    async fn resolve(&self, choice: ApprovalChoice) -> bool {
        self.resolve_choice(choice).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tool::ToolRequest;
    use crate::infrastructure::dispatcher::NullDispatcher;
    use crate::infrastructure::messenger::LoggingMessenger;
    use crate::infrastructure::store::SqliteApprovalStore;
    use serde_json::Map;
    use tempfile::tempdir;

    struct EmptyRegistry;
    impl ToolLookup for EmptyRegistry {
        fn get_tool(&self, _name: &str) -> Option<&crate::domain::tool::ToolDefinition> {
            None
        }
        fn get_service_name(&self, _name: &str) -> Option<&str> {
            Some("home_assistant")
        }
        fn required_args(&self, _name: &str) -> std::collections::HashSet<String> {
            Default::default()
        }
        fn arg_validators(&self, _name: &str) -> std::collections::HashMap<String, &regex::Regex> {
            Default::default()
        }
        fn signature_parts(&self, _name: &str, _args: &Map<String, Value>) -> Option<Vec<String>> {
            None
        }
        fn list_tools(&self) -> Vec<crate::domain::tool::ToolSummary> {
            Vec::new()
        }
    }

    async fn coordinator(ttl: Duration) -> (ApprovalCoordinator, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteApprovalStore::connect(&dir.path().join("wg.db")).await.unwrap());
        let coordinator = ApprovalCoordinator::new(
            store,
            Arc::new(LoggingMessenger),
            Arc::new(NullDispatcher),
            Arc::new(EmptyRegistry),
            ttl,
        );
        (coordinator, dir)
    }

    #[tokio::test]
    async fn request_then_resolve_completes_waiter_exactly_once() {
        let (coordinator, _dir) = coordinator(Duration::from_secs(30)).await;
        let request = ToolRequest {
            id: RequestId::new(),
            tool_name: "ha_ping".into(),
            args: Map::new(),
            signature: "ha_ping".into(),
        };
        let waiter = coordinator.request(&request).await.unwrap();
        assert_eq!(coordinator.pending_count(), 1);

        let resolved = coordinator
            .resolve_choice(ApprovalChoice {
                request_id: request.id,
                action: ApprovalAction::Allow,
                user_id: "alice".into(),
            })
            .await;
        assert!(resolved);
        assert_eq!(coordinator.pending_count(), 0);

        let result = waiter.wait().await;
        assert_eq!(result.action, ApprovalAction::Allow);

        // A second tap for the same id is a silent no-op.
        let resolved_again = coordinator
            .resolve_choice(ApprovalChoice {
                request_id: request.id,
                action: ApprovalAction::Deny,
                user_id: "mallory".into(),
            })
            .await;
        assert!(!resolved_again);
    }

    #[tokio::test]
    async fn timeout_guard_resolves_unanswered_requests() {
        let (coordinator, _dir) = coordinator(Duration::from_millis(30)).await;
        let request = ToolRequest {
            id: RequestId::new(),
            tool_name: "ha_ping".into(),
            args: Map::new(),
            signature: "ha_ping".into(),
        };
        let waiter = coordinator.request(&request).await.unwrap();
        let result = waiter.wait().await;
        assert!(result.is_timeout());
    }

    #[tokio::test]
    async fn detach_on_disconnect_executes_and_persists_offline_result() {
        let (coordinator, _dir) = coordinator(Duration::from_secs(30)).await;
        let request = ToolRequest {
            id: RequestId::new(),
            tool_name: "ha_ping".into(),
            args: Map::new(),
            signature: "ha_ping".into(),
        };
        coordinator.store.log_audit(&crate::domain::audit::AuditEntry::new_initial(
            request.id,
            now(),
            request.tool_name.clone(),
            request.args.clone(),
            request.signature.clone(),
            crate::domain::policy::Decision::Ask,
        )).await.unwrap();
        let waiter = coordinator.request(&request).await.unwrap();
        coordinator.detach_on_disconnect(request.clone(), waiter);

        coordinator
            .resolve_choice(ApprovalChoice {
                request_id: request.id,
                action: ApprovalAction::Allow,
                user_id: "alice".into(),
            })
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let unclaimed = coordinator.take_unclaimed_results().await.unwrap();
        assert_eq!(unclaimed.len(), 1);
        let parsed: Value = serde_json::from_str(unclaimed[0].result.as_deref().unwrap()).unwrap();
        assert_eq!(parsed["status"], json!("executed"));

        let log = coordinator.get_audit_log(10).await.unwrap();
        assert_eq!(log[0].resolution, Some(Resolution::Approved));
        assert_eq!(log[0].resolved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn resolve_all_denies_every_pending_request() {
        let (coordinator, _dir) = coordinator(Duration::from_secs(30)).await;
        let request = ToolRequest {
            id: RequestId::new(),
            tool_name: "ha_ping".into(),
            args: Map::new(),
            signature: "ha_ping".into(),
        };
        let waiter = coordinator.request(&request).await.unwrap();
        coordinator.resolve_all("gateway_shutdown").await;
        let result = waiter.wait().await;
        assert_eq!(result.action, ApprovalAction::Deny);
        assert_eq!(result.user_id, "gateway_shutdown");
    }
}
