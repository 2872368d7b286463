//! QueueClientBuilder - キュークライアントの構築とワイヤリング
//!
//! # 設計
//! - broker client は起動時に 1 度だけ作り、Sender と受信側で共有する
//! - build() 時に設定を検証（Fail-fast）
//!
//! # 使用例
//! ```ignore
//! let client = QueueClient::builder(broker)
//!     .queue(QueueName::new("orders")?)
//!     .max_concurrent_sessions(4)
//!     .telemetry(Arc::new(MetricsTelemetry::new("orders-service")))
//!     .build()?;
//! client.send(MessageType::Message, body, "s1", CorrelationId::new(), None).await?;
//! let receiver = client.register_message_receiver(Arc::new(handler));
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::dispatcher::{SessionDispatcher, TRANSIENT_BACKOFF};
use super::handler::MessageHandler;
use super::receiver::{ReceiverHandle, ReceiverOptions};
use super::sender::Sender;
use super::settings::ServiceBusConfig;
use crate::domain::{CorrelationId, MessageId, MessageType, QueueName, SendError};
use crate::impls::NoopTelemetry;
use crate::ports::{BrokerClient, Clock, SystemClock, TelemetrySink};

pub const DEFAULT_SERVICE_NAME: &str = "spool";

/// BuildError はクライアント構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("queue name is required")]
    MissingQueue,

    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

pub struct QueueClientBuilder {
    broker: Arc<dyn BrokerClient>,
    queue: Option<QueueName>,
    receiver: ReceiverOptions,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    clock: Option<Arc<dyn Clock>>,
    service_name: String,
    transient_backoff: Duration,
}

impl QueueClientBuilder {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            queue: None,
            receiver: ReceiverOptions::default(),
            telemetry: None,
            clock: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            transient_backoff: TRANSIENT_BACKOFF,
        }
    }

    /// Queue name and concurrency from validated settings.
    pub fn settings(self, config: &ServiceBusConfig) -> Self {
        self.queue(config.queue.clone())
            .max_concurrent_sessions(config.max_concurrent_sessions)
            .prefetch_count(config.prefetch_count)
    }

    pub fn queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    /// 0 = broker default.
    pub fn max_concurrent_sessions(mut self, n: usize) -> Self {
        self.receiver.max_concurrent_sessions = n;
        self
    }

    /// 0 = no prefetch.
    pub fn prefetch_count(mut self, n: u32) -> Self {
        self.receiver.prefetch_count = n;
        self
    }

    pub fn accept_wait(mut self, wait: Duration) -> Self {
        self.receiver.accept_wait = wait;
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.receiver.session_idle_timeout = timeout;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Prefix of metric names (`<service>.MessageSecondsQueued`, ...).
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn transient_backoff(mut self, backoff: Duration) -> Self {
        self.transient_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<QueueClient, BuildError> {
        let queue = self.queue.ok_or(BuildError::MissingQueue)?;
        if self.service_name.trim().is_empty() {
            return Err(BuildError::EmptyServiceName);
        }
        if self.receiver.accept_wait.is_zero() {
            return Err(BuildError::ZeroDuration("accept_wait"));
        }
        if self.receiver.session_idle_timeout.is_zero() {
            return Err(BuildError::ZeroDuration("session_idle_timeout"));
        }

        Ok(QueueClient {
            sender: Sender::new(Arc::clone(&self.broker), queue.clone()),
            broker: self.broker,
            queue,
            receiver: self.receiver,
            telemetry: self.telemetry.unwrap_or_else(|| Arc::new(NoopTelemetry)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            service_name: self.service_name,
            transient_backoff: self.transient_backoff,
        })
    }
}

/// QueueClient は送信と受信をまとめたハンドル
///
/// Clone すると同じ broker client を共有する。
#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn BrokerClient>,
    queue: QueueName,
    sender: Sender,
    receiver: ReceiverOptions,
    telemetry: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    service_name: String,
    transient_backoff: Duration,
}

impl QueueClient {
    pub fn builder(broker: Arc<dyn BrokerClient>) -> QueueClientBuilder {
        QueueClientBuilder::new(broker)
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn send(
        &self,
        message_type: MessageType,
        body: impl Into<Bytes>,
        session_id: impl Into<String>,
        correlation_id: CorrelationId,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<MessageId, SendError> {
        self.sender
            .send(message_type, body, session_id, correlation_id, scheduled_at)
            .await
    }

    /// Start session workers delivering to `handler`. Must be called inside a tokio runtime.
    pub fn register_message_receiver(&self, handler: Arc<dyn MessageHandler>) -> ReceiverHandle {
        let dispatcher = SessionDispatcher::new(
            handler,
            Arc::clone(&self.telemetry),
            Arc::clone(&self.clock),
            &self.service_name,
        )
        .with_backoff(self.transient_backoff);

        ReceiverHandle::spawn(
            Arc::clone(&self.broker),
            self.queue.clone(),
            Arc::new(dispatcher),
            self.receiver.clone(),
        )
    }
}
