//! Broker port - セッション付きキューの抽象化
//!
//! broker に求めるもの:
//! - session ごとの排他ロックと FIFO 配送
//! - at-least-once 配送
//! - lock token による complete / abandon

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BrokerError, LockToken, LockedMessage, MessageEnvelope, MessageId, QueueName, SessionId};

/// Session count used when the caller passes 0 and the broker has no opinion.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 16;

/// BrokerClient はプロセス内で 1 つだけ作り、送信と受信で共有する
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one envelope. Returns the broker-assigned id.
    async fn send(&self, queue: &QueueName, envelope: MessageEnvelope) -> Result<MessageId, BrokerError>;

    /// Lock the next session that has deliverable messages.
    ///
    /// Returns `Ok(None)` if no session became available within `wait`.
    async fn accept_next_session(
        &self,
        queue: &QueueName,
        prefetch_count: u32,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, BrokerError>;

    /// Concurrency used when the configured session count is 0.
    fn default_max_concurrent_sessions(&self) -> usize {
        DEFAULT_MAX_CONCURRENT_SESSIONS
    }
}

/// 排他ロック済みの 1 session
///
/// 1 つの worker だけが保持する。close するとロックが解放され、
/// 未処理のメッセージは再配送可能になる。
#[async_trait]
pub trait SessionReceiver: Send + Sync {
    fn session_id(&self) -> &SessionId;

    /// Next message of this session, or `Ok(None)` after `wait` with nothing to deliver.
    async fn receive(&self, wait: Duration) -> Result<Option<LockedMessage>, BrokerError>;

    /// Acknowledge: the message is removed permanently.
    async fn complete(&self, lock_token: LockToken) -> Result<(), BrokerError>;

    /// Release the lock: the message becomes eligible for redelivery.
    async fn abandon(&self, lock_token: LockToken) -> Result<(), BrokerError>;

    /// Extend the session lock. Returns the new expiry.
    async fn renew_lock(&self) -> Result<DateTime<Utc>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
