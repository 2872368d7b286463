//! Application handler: log each message and optionally call a downstream URL.

use std::time::Duration;

use async_trait::async_trait;
use spool_core::app::MessageHandler;
use spool_core::{CorrelationId, HandlerError, MessageType};
use tracing::{info, warn};

pub struct ProcessMessageHandler {
    http: reqwest::Client,
    downstream_url: Option<String>,
}

/// HTTP client for the downstream call. Requests past `timeout` fail with a timeout error.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

impl ProcessMessageHandler {
    pub fn new(http: reqwest::Client, downstream_url: Option<String>) -> Self {
        Self {
            http,
            downstream_url,
        }
    }
}

#[async_trait]
impl MessageHandler for ProcessMessageHandler {
    async fn handle(
        &self,
        message_type: MessageType,
        correlation_id: CorrelationId,
        body: &str,
    ) -> Result<(), HandlerError> {
        info!(%message_type, %correlation_id, body, "Processed Message");

        let Some(url) = &self.downstream_url else {
            return Ok(());
        };

        let response = self
            .http
            .get(url)
            .header("x-correlation-id", correlation_id.to_string())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    HandlerError::Timeout(err.to_string())
                } else {
                    HandlerError::external(format!("GET {url}"), err)
                }
            })?;

        // The response status does not affect the message.
        let status = response.status();
        if !status.is_success() {
            warn!(%correlation_id, url, %status, "downstream call returned an error status");
        }
        Ok(())
    }
}
