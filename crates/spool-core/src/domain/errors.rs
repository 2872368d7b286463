//! Errors - エラー型と分類
//!
//! - `BrokerError`: broker が報告する失敗（condition + transient フラグ）
//! - `HandlerError`: ユーザー handler が返す失敗
//! - `DispatchError`: 1 回の配送試行中に発生した失敗の総称
//! - `ErrorKind`: 運用上の分類（Transient / LockOrTimeout / Fatal）
//!
//! 分類そのものは `app::classifier` の純粋関数で行う。

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ErrorKind は配送中の失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Retry in place, keeping the lock.
    Transient,
    /// Release the lock so the broker redelivers the message.
    LockOrTimeout,
    /// Drop the message after logging.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::LockOrTimeout => "lock_or_timeout",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} has an invalid format: {reason}")]
    InvalidFormat {
        field: &'static str,
        reason: &'static str,
    },
}

/// Named failure categories a broker can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerCondition {
    MessageLockLost,
    SessionLockLost,
    Timeout,
    ServerBusy,
    QuotaExceeded,
    EntityNotFound,
    MessageTooLarge,
    Unauthorized,
    Communication,
    Other,
}

impl BrokerCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerCondition::MessageLockLost => "message lock lost",
            BrokerCondition::SessionLockLost => "session lock lost",
            BrokerCondition::Timeout => "operation timed out",
            BrokerCondition::ServerBusy => "server busy",
            BrokerCondition::QuotaExceeded => "quota exceeded",
            BrokerCondition::EntityNotFound => "entity not found",
            BrokerCondition::MessageTooLarge => "message too large",
            BrokerCondition::Unauthorized => "unauthorized",
            BrokerCondition::Communication => "communication failure",
            BrokerCondition::Other => "broker failure",
        }
    }

    /// Transient flag a broker attaches when the caller does not override it.
    /// Only communication hiccups are retryable without redelivery.
    pub fn transient_by_default(self) -> bool {
        matches!(self, BrokerCondition::Communication)
    }
}

impl fmt::Display for BrokerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the broker (publish, receive, complete, abandon).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition}: {message}")]
pub struct BrokerError {
    condition: BrokerCondition,
    message: String,
    transient: bool,
}

impl BrokerError {
    pub fn new(condition: BrokerCondition, message: impl Into<String>) -> Self {
        Self {
            condition,
            message: message.into(),
            transient: condition.transient_by_default(),
        }
    }

    /// Override the broker's transient flag.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// A communication failure the broker flags as retryable.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BrokerCondition::Communication, message).with_transient(true)
    }

    pub fn message_lock_lost(message: impl Into<String>) -> Self {
        Self::new(BrokerCondition::MessageLockLost, message)
    }

    pub fn session_lock_lost(message: impl Into<String>) -> Self {
        Self::new(BrokerCondition::SessionLockLost, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(BrokerCondition::Timeout, format!("after {after:?}"))
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(BrokerCondition::ServerBusy, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(BrokerCondition::QuotaExceeded, message)
    }

    pub fn entity_not_found(entity: impl fmt::Display) -> Self {
        Self::new(BrokerCondition::EntityNotFound, entity.to_string())
    }

    pub fn condition(&self) -> BrokerCondition {
        self.condition
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// HandlerError はユーザー handler が返す失敗
///
/// Broker 由来の失敗をそのまま返せば、dispatcher 側で同じ分類が適用される。
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("handler timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Failed(String),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl HandlerError {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Broker(BrokerError::transient(message))
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Everything that can go wrong while delivering one locked message.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message property '{0}' is missing")]
    MissingProperty(&'static str),

    #[error("message property '{name}' has unexpected value {value}")]
    InvalidProperty { name: &'static str, value: String },

    #[error("message body is not valid UTF-8: {0}")]
    InvalidBody(#[from] std::str::Utf8Error),

    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("failed to complete message: {0}")]
    Complete(#[source] BrokerError),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid session id: {0}")]
    InvalidSession(#[from] ValidationError),

    #[error("failed to publish message: {0}")]
    Broker(#[from] BrokerError),
}
