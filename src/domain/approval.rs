//! Approval types and the single-write/many-read [`Waiter`] promise
//! (spec.md §9 Design Notes: "single-shot waiters ... future/promise
//! primitive").

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};

use super::ids::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Allow,
    Deny,
}

/// The guardian's decision (human tap, or the messenger's own timeout
/// synthesis) on a single request. `user_id == "timeout"` is the sentinel
/// that identifies a timeout origin (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub request_id: RequestId,
    pub action: ApprovalAction,
    pub user_id: String,
    pub timestamp: f64,
}

impl ApprovalResult {
    pub const TIMEOUT_USER_ID: &'static str = "timeout";

    pub fn is_timeout(&self) -> bool {
        self.user_id == Self::TIMEOUT_USER_ID
    }
}

/// The durable row backing a pending approval (spec.md §3 "Persisted
/// Pending Row"). `result` is `None` until resolved while the agent was
/// disconnected; it is written exactly once (null -> populated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRow {
    pub request_id: RequestId,
    pub tool_name: String,
    pub args: Value,
    pub signature: String,
    pub message_id: String,
    pub created_at: f64,
    pub expires_at: f64,
    pub result: Option<String>,
}

struct WaiterInner<T> {
    value: RwLock<Option<T>>,
    notify: Notify,
}

/// A one-value promise supporting exactly one write and many concurrent
/// reads of the same value (spec.md §9). Cloning shares the same
/// underlying cell — the session task and a detached offline-completion
/// task can each hold a clone and both observe the same resolution.
pub struct Waiter<T> {
    inner: Arc<WaiterInner<T>>,
}

impl<T> Clone for Waiter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync> Waiter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaiterInner {
                value: RwLock::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Write the value if and only if nothing has been written yet. Returns
    /// `true` if this call performed the (only) write.
    pub async fn complete(&self, value: T) -> bool {
        let mut guard = self.inner.value.write().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        self.inner.notify.notify_waiters();
        true
    }

    /// Await the value, resolving immediately if it was already written
    /// before this call.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(v) = self.inner.value.read().await.clone() {
                return v;
            }
            let notified = self.inner.notify.notified();
            // Re-check after subscribing but before awaiting, closing the
            // race between the check above and `notify_waiters()`.
            if let Some(v) = self.inner.value.read().await.clone() {
                return v;
            }
            notified.await;
        }
    }

    pub async fn peek(&self) -> Option<T> {
        self.inner.value.read().await.clone()
    }
}

impl<T: Clone + Send + Sync> Default for Waiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiter_delivers_value_to_late_subscriber() {
        let w: Waiter<i32> = Waiter::new();
        assert!(w.complete(42).await);
        assert_eq!(w.wait().await, 42);
    }

    #[tokio::test]
    async fn waiter_second_complete_is_noop() {
        let w: Waiter<i32> = Waiter::new();
        assert!(w.complete(1).await);
        assert!(!w.complete(2).await);
        assert_eq!(w.wait().await, 1);
    }

    #[tokio::test]
    async fn waiter_supports_many_concurrent_readers() {
        let w: Waiter<i32> = Waiter::new();
        let w2 = w.clone();
        let w3 = w.clone();
        let handle = tokio::spawn(async move { w2.wait().await });
        let handle3 = tokio::spawn(async move { w3.wait().await });
        w.complete(7).await;
        assert_eq!(handle.await.unwrap(), 7);
        assert_eq!(handle3.await.unwrap(), 7);
    }
}
