//! HTTP service dispatcher (C7, spec.md §4.7), grounded on
//! `original_source/src/agent_gate/services/http.py`: each configured
//! service is a base URL; a tool call becomes a POST of its args to
//! `{base_url}/{tool_name}`.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use url::Url;

use crate::domain::dispatcher::{DispatchError, ServiceDispatcher};

pub struct HttpServiceDispatcher {
    client: Client,
    services: HashMap<String, Url>,
}

impl HttpServiceDispatcher {
    pub fn new(client: Client, services: HashMap<String, Url>) -> Self {
        Self { client, services }
    }
}

#[async_trait]
impl ServiceDispatcher for HttpServiceDispatcher {
    async fn dispatch(
        &self,
        service_name: &str,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let base = self
            .services
            .get(service_name)
            .ok_or_else(|| DispatchError::ServiceNotConfigured(service_name.to_string()))?;

        let url = base
            .join(tool_name)
            .map_err(|e| DispatchError::Upstream(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(args)
            .send()
            .await
            .map_err(|e| DispatchError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::Upstream(format!(
                "service '{service_name}' returned status {}",
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DispatchError::Upstream(e.to_string()))
    }
}
