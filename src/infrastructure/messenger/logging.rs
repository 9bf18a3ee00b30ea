//! A messenger that only logs the prompt (C6, spec.md §4.6), for local
//! development and for tests that exercise the approval pipeline without a
//! real guardian channel.

use async_trait::async_trait;
use tracing::info;

use crate::domain::messenger::{ApprovalPrompt, MessengerAdapter, MessengerError};

#[derive(Default)]
pub struct LoggingMessenger;

#[async_trait]
impl MessengerAdapter for LoggingMessenger {
    async fn send_prompt(&self, prompt: &ApprovalPrompt) -> Result<(), MessengerError> {
        info!(
            request_id = %prompt.request_id,
            signature = %prompt.signature,
            expires_at = prompt.expires_at,
            "approval requested"
        );
        Ok(())
    }
}
