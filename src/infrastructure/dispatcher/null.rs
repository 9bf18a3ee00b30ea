//! A dispatcher that never calls out, for unit tests that need to exercise
//! the gateway's decision pipeline without a live backend service.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::domain::dispatcher::{DispatchError, ServiceDispatcher};

#[derive(Default)]
pub struct NullDispatcher;

#[async_trait]
impl ServiceDispatcher for NullDispatcher {
    async fn dispatch(
        &self,
        _service_name: &str,
        tool_name: &str,
        _args: &Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        Ok(json!({"ok": true, "tool": tool_name}))
    }
}
