//! Per-connection session state machine (spec.md §4.9, §6): authenticates
//! once under a hard deadline, then reads JSON-RPC requests off a
//! [`Transport`], dispatching each to its own concurrent handler that
//! validates, evaluates policy, and drives the request through to a reply —
//! whether that reply is immediate (allow/deny) or waits on a human tap
//! (ask).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::coordinator::ApprovalCoordinator;
use crate::application::policy_service::PolicyService;
use crate::domain::approval::{ApprovalAction, ApprovalResult};
use crate::domain::audit::{AuditEntry, Resolution};
use crate::domain::dispatcher::ServiceDispatcher;
use crate::domain::ids::RequestId;
use crate::domain::policy::{Decision, PolicyEngine};
use crate::domain::store::ApprovalStore;
use crate::domain::tool::{ToolLookup, ToolRequest};
use crate::infrastructure::rate_limiter::RateLimiter;
use crate::presentation::rpc::{error_codes, RpcRequest, RpcResponse};

/// Hard deadline for the auth phase (spec.md §4.9).
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Other(String),
}

/// Abstracts the wire socket so the session state machine is unit-testable
/// without real networking — axum's WebSocket adapts to this in
/// `presentation::server`.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    /// Explicit socket teardown, called after an auth-phase failure. A
    /// default no-op is fine for in-memory test transports.
    async fn close(&mut self) {}
}

fn now() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn tokens_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Clone)]
pub struct GatewaySession {
    pub registry: Arc<dyn ToolLookup>,
    pub policy_engine: Arc<PolicyEngine>,
    pub coordinator: Arc<ApprovalCoordinator>,
    pub dispatcher: Arc<dyn ServiceDispatcher>,
    pub store: Arc<dyn ApprovalStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub agent_token: Arc<String>,
    pub approval_ttl: Duration,
    pub max_pending_approvals: usize,
}

impl GatewaySession {
    /// Drive one connection end to end. `cancel` fires when the gateway
    /// wants every active connection torn down (graceful shutdown); the
    /// loop also exits on its own when `transport` closes. Either way, a
    /// connection-local token is cancelled so any handler still awaiting a
    /// guardian decision hands its request off to `DetachOnDisconnect`
    /// instead of trying to reply to a socket that is going away.
    pub async fn run(&self, mut transport: Box<dyn Transport>, cancel: CancellationToken) {
        if !self.authenticate(&mut transport).await {
            return;
        }

        let connection_cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(encoded) => {
                            if transport.send(encoded).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = transport.recv() => {
                    match frame {
                        None => break,
                        Some(Err(err)) => {
                            warn!(error = %err, "transport read failed");
                            break;
                        }
                        Some(Ok(raw)) => {
                            let session = self.clone();
                            let tx = tx.clone();
                            let handler_cancel = connection_cancel.clone();
                            handlers.spawn(async move {
                                if let Some(response) = session.handle_message(&raw, &handler_cancel).await {
                                    match serde_json::to_string(&response) {
                                        Ok(encoded) => {
                                            let _ = tx.send(encoded);
                                        }
                                        Err(err) => warn!(error = %err, "failed to encode response"),
                                    }
                                }
                            });
                        }
                    }
                }
            }
        }

        // The connection is going away one way or another: anything still
        // awaiting a guardian tap detaches rather than racing a dead write.
        connection_cancel.cancel();
        while handlers.join_next().await.is_some() {}
    }

    /// Read exactly one message under `AUTH_TIMEOUT`; on any failure, send
    /// the corresponding error and close the socket without ever entering
    /// the message loop (spec.md §4.9).
    async fn authenticate(&self, transport: &mut Box<dyn Transport>) -> bool {
        let frame = match timeout(AUTH_TIMEOUT, transport.recv()).await {
            Ok(Some(Ok(raw))) => raw,
            Ok(Some(Err(err))) => {
                warn!(error = %err, "transport error during auth");
                return false;
            }
            Ok(None) => return false,
            Err(_) => {
                self.reject_auth(transport, Value::Null, "authentication timed out").await;
                return false;
            }
        };

        let request: RpcRequest = match serde_json::from_str(&frame) {
            Ok(r) => r,
            Err(err) => {
                let _ = transport
                    .send(serde_json::to_string(&RpcResponse::failure(Value::Null, error_codes::PARSE_ERROR, err.to_string())).unwrap())
                    .await;
                transport.close().await;
                return false;
            }
        };

        if request.method.as_deref() != Some("auth") {
            self.reject_auth(transport, request.id, "first message must be 'auth'").await;
            return false;
        }

        let token = request.params.get("token").and_then(Value::as_str).unwrap_or("");
        if !tokens_equal(token, &self.agent_token) {
            self.reject_auth(transport, request.id, "invalid agent token").await;
            return false;
        }

        let response = RpcResponse::success(request.id, json!({"status": "authenticated"}));
        if let Ok(encoded) = serde_json::to_string(&response) {
            let _ = transport.send(encoded).await;
        }
        true
    }

    async fn reject_auth(&self, transport: &mut Box<dyn Transport>, id: Value, message: &str) {
        let response = RpcResponse::failure(id, error_codes::NOT_AUTHENTICATED, message);
        if let Ok(encoded) = serde_json::to_string(&response) {
            let _ = transport.send(encoded).await;
        }
        transport.close().await;
    }

    /// `None` means no reply is sent at all — the connection is gone and
    /// the request has been handed to `DetachOnDisconnect`.
    async fn handle_message(&self, raw: &str, cancel: &CancellationToken) -> Option<RpcResponse> {
        let request: RpcRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(err) => return Some(RpcResponse::failure(Value::Null, error_codes::PARSE_ERROR, err.to_string())),
        };

        let Some(method) = request.method.clone() else {
            return Some(RpcResponse::failure(request.id, error_codes::INVALID_REQUEST, "missing method"));
        };

        match method.as_str() {
            "tool_request" => self.handle_tool_request(request, cancel).await,
            "list_tools" => Some(self.handle_list_tools(request)),
            "get_pending_results" => Some(self.handle_get_pending_results(request).await),
            other => Some(RpcResponse::failure(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            )),
        }
    }

    async fn handle_tool_request(&self, request: RpcRequest, cancel: &CancellationToken) -> Option<RpcResponse> {
        if matches!(request.id, Value::Null) {
            return Some(RpcResponse::failure(request.id, error_codes::INVALID_REQUEST, "missing or null id"));
        }

        let Some(tool_name) = request.params.get("tool").and_then(Value::as_str).map(str::to_string) else {
            return Some(RpcResponse::failure(request.id, error_codes::INVALID_REQUEST, "missing tool"));
        };

        if !self.rate_limiter.check("tool_request") {
            return Some(RpcResponse::failure(request.id, error_codes::RATE_LIMIT_EXCEEDED, "rate limit exceeded"));
        }

        let args: Map<String, Value> = request
            .params
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let service = PolicyService::new(self.registry.as_ref(), self.policy_engine.as_ref());
        let evaluation = match service.evaluate(&tool_name, &args) {
            Ok(e) => e,
            Err(err) => {
                return Some(RpcResponse::failure(request.id, error_codes::INVALID_REQUEST, err.to_string()));
            }
        };

        let request_id = RequestId::new();
        let entry = AuditEntry::new_initial(
            request_id,
            now(),
            tool_name.clone(),
            args.clone(),
            evaluation.signature.clone(),
            evaluation.decision,
        );
        if let Err(err) = self.store.log_audit(&entry).await {
            warn!(%request_id, error = %err, "failed to write initial audit row");
        }

        match evaluation.decision {
            Decision::Deny => Some(RpcResponse::failure(request.id, error_codes::POLICY_DENIED, "denied by policy")),
            Decision::Allow => Some(
                self.execute_and_reply(request.id, request_id, &tool_name, &args, Resolution::Executed, None)
                    .await,
            ),
            Decision::Ask => {
                self.ask_and_reply(request, request_id, tool_name, evaluation.signature, args, cancel)
                    .await
            }
        }
    }

    async fn ask_and_reply(
        &self,
        request: RpcRequest,
        request_id: RequestId,
        tool_name: String,
        signature: String,
        args: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Option<RpcResponse> {
        if self.coordinator.pending_count() >= self.max_pending_approvals {
            return Some(RpcResponse::failure(request.id, error_codes::RATE_LIMIT_EXCEEDED, "too many pending approvals"));
        }

        let tool_request = ToolRequest {
            id: request_id,
            tool_name: tool_name.clone(),
            args: args.clone(),
            signature,
        };

        let waiter = match self.coordinator.request(&tool_request).await {
            Ok(w) => w,
            Err(err) => {
                return Some(RpcResponse::failure(request.id, error_codes::EXECUTION_FAILED, err.to_string()));
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(%request_id, "connection lost while awaiting approval; detaching");
                self.coordinator.detach_on_disconnect(tool_request, waiter);
                None
            }
            result = waiter.wait() => {
                Some(self.finish_connected(request.id, request_id, &tool_name, &args, result).await)
            }
        }
    }

    async fn finish_connected(
        &self,
        rpc_id: Value,
        request_id: RequestId,
        tool_name: &str,
        args: &Map<String, Value>,
        result: ApprovalResult,
    ) -> RpcResponse {
        if let Err(err) = self.store.delete_pending(request_id).await {
            warn!(%request_id, error = %err, "failed to delete resolved pending row");
        }

        if result.is_timeout() {
            if let Err(err) = self
                .store
                .update_audit_resolution(request_id, Resolution::TimedOut, Some(result.user_id), result.timestamp, None)
                .await
            {
                warn!(%request_id, error = %err, "failed to update audit resolution");
            }
            return RpcResponse::failure(rpc_id, error_codes::APPROVAL_TIMEOUT, "approval timed out");
        }

        match result.action {
            ApprovalAction::Allow => {
                self.execute_and_reply(rpc_id, request_id, tool_name, args, Resolution::Approved, Some(result.user_id))
                    .await
            }
            ApprovalAction::Deny => {
                if let Err(err) = self
                    .store
                    .update_audit_resolution(request_id, Resolution::Denied, Some(result.user_id), result.timestamp, None)
                    .await
                {
                    warn!(%request_id, error = %err, "failed to update audit resolution");
                }
                RpcResponse::failure(rpc_id, error_codes::APPROVAL_DENIED, "denied by guardian")
            }
        }
    }

    async fn execute_and_reply(
        &self,
        rpc_id: Value,
        request_id: RequestId,
        tool_name: &str,
        args: &Map<String, Value>,
        resolution: Resolution,
        resolved_by: Option<String>,
    ) -> RpcResponse {
        let Some(service_name) = self.registry.get_service_name(tool_name).map(str::to_string) else {
            return RpcResponse::failure(rpc_id, error_codes::EXECUTION_FAILED, format!("unknown tool: {tool_name}"));
        };

        let resolved_at = now();
        match self.dispatcher.dispatch(&service_name, tool_name, args).await {
            Ok(result) => {
                if let Err(err) = self
                    .store
                    .update_audit_resolution(request_id, resolution, resolved_by, resolved_at, Some(result.clone()))
                    .await
                {
                    warn!(%request_id, error = %err, "failed to update audit resolution");
                }
                RpcResponse::success(rpc_id, json!({"status": "executed", "data": result}))
            }
            Err(err) => {
                if let Err(store_err) = self
                    .store
                    .update_audit_resolution(request_id, resolution, resolved_by, resolved_at, None)
                    .await
                {
                    warn!(%request_id, error = %store_err, "failed to update audit resolution");
                }
                warn!(%request_id, error = %err, "dispatch failed");
                RpcResponse::failure(rpc_id, error_codes::EXECUTION_FAILED, "execution failed")
            }
        }
    }

    fn handle_list_tools(&self, request: RpcRequest) -> RpcResponse {
        RpcResponse::success(request.id, json!({"tools": self.registry.list_tools()}))
    }

    async fn handle_get_pending_results(&self, request: RpcRequest) -> RpcResponse {
        match self.coordinator.take_unclaimed_results().await {
            Ok(rows) => RpcResponse::success(request.id, json!({"results": rows})),
            Err(err) => RpcResponse::failure(request.id, error_codes::EXECUTION_FAILED, err.to_string()),
        }
    }
}
