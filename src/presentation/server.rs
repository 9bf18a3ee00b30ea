//! Process wiring (spec.md §6): the axum app, the WebSocket-to-`Transport`
//! adapter, the single-agent-connection guard, and the inbound webhook that
//! lets a guardian channel resolve a pending approval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::application::coordinator::ApprovalCoordinator;
use crate::domain::approval::ApprovalAction;
use crate::domain::dispatcher::ServiceDispatcher;
use crate::domain::messenger::{ApprovalChoice, ApprovalResolver};
use crate::domain::policy::PolicyEngine;
use crate::domain::store::ApprovalStore;
use crate::domain::tool::ToolLookup;
use crate::infrastructure::rate_limiter::RateLimiter;
use crate::presentation::session::{GatewaySession, Transport, TransportError};

/// The close code the gateway sends a second simultaneous agent connection
/// (spec.md §5.1 "only one live agent connection at a time").
pub const SINGLE_CONNECTION_CLOSE_CODE: u16 = 4000;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub connected: bool,
    pub pending_count: u32,
    pub uptime_seconds: f64,
    /// Folds in the messenger's and dispatcher's own `health_check()`
    /// (spec.md §9 "HealthCheck() -> bool"; SPEC_FULL.md §3 "Health status").
    pub healthy: bool,
}

struct WebSocketTransport(WebSocket);

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.0.recv().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(TransportError::Other(err.to_string()))),
            }
        }
    }

    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
    }
}

/// Shared, constructor-wired process state. A `Gateway` is the one place
/// the "only one agent at a time" invariant lives — as an explicit field
/// here, never as process-global state.
#[derive(Clone)]
pub struct Gateway {
    connected: Arc<AtomicBool>,
    active_cancel: Arc<Mutex<Option<CancellationToken>>>,
    started_at: std::time::Instant,
    registry: Arc<dyn ToolLookup>,
    policy_engine: Arc<PolicyEngine>,
    coordinator: Arc<ApprovalCoordinator>,
    dispatcher: Arc<dyn ServiceDispatcher>,
    store: Arc<dyn ApprovalStore>,
    rate_limiter: Arc<RateLimiter>,
    agent_token: Arc<String>,
    approval_ttl: Duration,
    max_pending_approvals: usize,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn ToolLookup>,
        policy_engine: Arc<PolicyEngine>,
        coordinator: Arc<ApprovalCoordinator>,
        dispatcher: Arc<dyn ServiceDispatcher>,
        store: Arc<dyn ApprovalStore>,
        rate_limiter: Arc<RateLimiter>,
        agent_token: String,
        approval_ttl: Duration,
        max_pending_approvals: usize,
    ) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            active_cancel: Arc::new(Mutex::new(None)),
            started_at: std::time::Instant::now(),
            registry,
            policy_engine,
            coordinator,
            dispatcher,
            store,
            rate_limiter,
            agent_token: Arc::new(agent_token),
            approval_ttl,
            max_pending_approvals,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/webhook/approval", post(webhook_handler))
            .route("/health", get(health_handler))
            .route("/audit", get(audit_log_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn health_status(&self) -> HealthReport {
        let pending_count = self.coordinator.count_unresolved().await.unwrap_or(0);
        let healthy = self.coordinator.health_check().await;
        HealthReport {
            connected: self.connected.load(Ordering::SeqCst),
            pending_count,
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            healthy,
        }
    }

    /// Stop accepting new frames on the active connection (if any) and
    /// resolve every outstanding approval with a synthetic deny, so no
    /// agent or detached task hangs forever across a process shutdown
    /// (spec.md §5 "graceful shutdown").
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.active_cancel.lock().await.as_ref() {
            cancel.cancel();
        }
        self.coordinator.resolve_all("gateway_shutdown").await;
    }

    fn session(&self) -> GatewaySession {
        GatewaySession {
            registry: self.registry.clone(),
            policy_engine: self.policy_engine.clone(),
            coordinator: self.coordinator.clone(),
            dispatcher: self.dispatcher.clone(),
            store: self.store.clone(),
            rate_limiter: self.rate_limiter.clone(),
            agent_token: self.agent_token.clone(),
            approval_ttl: self.approval_ttl,
            max_pending_approvals: self.max_pending_approvals,
        }
    }

    async fn accept_connection(&self) -> Option<CancellationToken> {
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let cancel = CancellationToken::new();
        *self.active_cancel.lock().await = Some(cancel.clone());
        Some(cancel)
    }

    async fn release_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.active_cancel.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::coordinator::ApprovalCoordinator;
    use crate::application::registry::ToolRegistry;
    use crate::domain::policy::PolicyEngine;
    use crate::infrastructure::dispatcher::NullDispatcher;
    use crate::infrastructure::messenger::LoggingMessenger;
    use crate::infrastructure::store::SqliteApprovalStore;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn gateway() -> (Gateway, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteApprovalStore::connect(&dir.path().join("wg.db")).await.unwrap());
        let registry: Arc<dyn ToolLookup> = Arc::new(ToolRegistry::build(vec![]).unwrap());
        let policy_engine = Arc::new(PolicyEngine::compile(&[], &[]).unwrap());
        let dispatcher = Arc::new(NullDispatcher);
        let coordinator = Arc::new(ApprovalCoordinator::new(
            store.clone(),
            Arc::new(LoggingMessenger),
            dispatcher.clone(),
            registry.clone(),
            Duration::from_secs(5),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 100));
        let gw = Gateway::new(
            registry,
            policy_engine,
            coordinator,
            dispatcher,
            store,
            rate_limiter,
            "token".to_string(),
            Duration::from_secs(5),
            10,
        );
        (gw, dir)
    }

    #[tokio::test]
    async fn second_connection_is_rejected_until_first_releases() {
        let (gw, _dir) = gateway().await;

        let first = gw.accept_connection().await;
        assert!(first.is_some());

        let second = gw.accept_connection().await;
        assert!(second.is_none(), "a second concurrent connection must be rejected");

        gw.release_connection().await;
        let third = gw.accept_connection().await;
        assert!(third.is_some(), "a new connection is admitted once the first releases");
    }

    #[tokio::test]
    async fn health_status_reports_connected_flag() {
        let (gw, _dir) = gateway().await;
        assert!(!gw.health_status().await.connected);
        gw.accept_connection().await;
        assert!(gw.health_status().await.connected);
    }
}

async fn ws_handler(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(gateway, socket))
}

async fn handle_socket(gateway: Gateway, socket: WebSocket) {
    let Some(cancel) = gateway.accept_connection().await else {
        warn!("rejecting second simultaneous agent connection");
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: SINGLE_CONNECTION_CLOSE_CODE,
                reason: "another agent is already connected".into(),
            })))
            .await;
        return;
    };

    info!("agent connected");
    let session = gateway.session();
    session.run(Box::new(WebSocketTransport(socket)), cancel).await;
    gateway.release_connection().await;
    info!("agent disconnected");
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    request_id: String,
    action: ApprovalAction,
    user_id: String,
}

async fn webhook_handler(
    State(gateway): State<Gateway>,
    Json(body): Json<WebhookBody>,
) -> impl IntoResponse {
    let request_id = match body.request_id.parse() {
        Ok(id) => id,
        Err(_) => return (axum::http::StatusCode::BAD_REQUEST, "invalid request_id").into_response(),
    };

    let resolved = gateway
        .coordinator
        .resolve(ApprovalChoice {
            request_id,
            action: body.action,
            user_id: body.user_id,
        })
        .await;

    if resolved {
        axum::http::StatusCode::OK.into_response()
    } else {
        (axum::http::StatusCode::CONFLICT, "already resolved or unknown request").into_response()
    }
}

async fn health_handler(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(gateway.health_status().await)
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<u32>,
}

/// Read-only audit trail surface (SPEC_FULL.md §4.5 supplement); not part of
/// the agent-facing wire protocol, just an ops/dashboard read.
async fn audit_log_handler(
    State(gateway): State<Gateway>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    match gateway.coordinator.get_audit_log(query.limit.unwrap_or(100)).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
