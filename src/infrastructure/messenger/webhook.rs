//! Generic HTTP-webhook messenger (C6, spec.md §4.6), generalizing
//! `original_source/src/agentpass/messenger/telegram.py`'s "POST a prompt,
//! receive a callback" shape to an arbitrary webhook receiver instead of
//! one vendor's bot API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::domain::messenger::{ApprovalPrompt, MessengerAdapter, MessengerError};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    request_id: String,
    tool_name: &'a str,
    signature: &'a str,
    expires_at: f64,
}

pub struct WebhookMessenger {
    client: Client,
    endpoint: Url,
}

impl WebhookMessenger {
    pub fn new(endpoint: Url, client: Client) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl MessengerAdapter for WebhookMessenger {
    async fn send_prompt(&self, prompt: &ApprovalPrompt) -> Result<(), MessengerError> {
        let payload = WebhookPayload {
            request_id: prompt.request_id.to_string(),
            tool_name: &prompt.tool_name,
            signature: &prompt.signature,
            expires_at: prompt.expires_at,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| MessengerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MessengerError::Transport(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
