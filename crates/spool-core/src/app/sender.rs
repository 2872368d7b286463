//! Sender - 型付きメッセージを session 付きでキューへ送る
//!
//! broker の失敗はそのまま `SendError` で呼び出し元へ返す（ここでは再試行しない）。

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::{
    CorrelationId, MessageEnvelope, MessageId, MessageType, QueueName, SendError, SessionId,
};
use crate::ports::BrokerClient;

#[derive(Clone)]
pub struct Sender {
    broker: Arc<dyn BrokerClient>,
    queue: QueueName,
}

impl Sender {
    pub fn new(broker: Arc<dyn BrokerClient>, queue: QueueName) -> Self {
        Self { broker, queue }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Publish one message on `session_id`.
    ///
    /// `scheduled_at` defers visibility until that instant.
    pub async fn send(
        &self,
        message_type: MessageType,
        body: impl Into<Bytes>,
        session_id: impl Into<String>,
        correlation_id: CorrelationId,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<MessageId, SendError> {
        let session_id = SessionId::new(session_id)?;

        let mut envelope = MessageEnvelope::new(message_type, body, session_id.clone(), correlation_id);
        if let Some(at) = scheduled_at {
            envelope = envelope.with_scheduled_enqueue_time(at);
        }

        let message_id = self
            .broker
            .send(&self.queue, envelope)
            .await
            .inspect_err(|err| {
                warn!(
                    queue = %self.queue,
                    %session_id,
                    %correlation_id,
                    error = %err,
                    "failed to publish queue message"
                );
            })?;

        debug!(
            queue = %self.queue,
            %session_id,
            %message_id,
            %correlation_id,
            %message_type,
            "queue message sent"
        );
        Ok(message_id)
    }
}
