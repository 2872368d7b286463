//! Domain identifiers (strongly-typed IDs).
//!
//! # ID の種類
//! - `MessageId` / `LockToken`: broker が払い出す ID。ULID ベースの `Id<T>`。
//! - `CorrelationId`: 送信側が付与する UUID。ワイヤ上は文字列。
//! - `SessionId` / `QueueName`: 検証済みの文字列。
//!
//! ## Phantom Type パターン
//! `Id<T>` は ULID を包むジェネリック型で、`T` はコンパイル時のみのマーカー型。
//! MessageId と LockToken を取り違えるとコンパイルエラーになる。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

use super::errors::ValidationError;

/// Maximum session id length accepted by the broker.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Maximum queue (entity) name length.
pub const MAX_QUEUE_NAME_LEN: usize = 260;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"msg-", "lock-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 現在時刻ベースで新しい Id を払い出す
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Message のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Lock のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lock {}

impl IdMarker for Lock {
    fn prefix() -> &'static str {
        "lock-"
    }
}

/// Broker-assigned identifier of one queued message.
pub type MessageId = Id<Message>;

/// Broker-issued handle authorizing complete/abandon of one delivery.
pub type LockToken = Id<Lock>;

/// Correlation identifier carried from the sender to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Fresh random (v4) correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the wire form. Accepts every textual form `Uuid` understands
    /// (hyphenated, simple, braced, urn).
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Session (partition) key. Messages sharing a session are delivered in
/// order to one consumer at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::Required { field: "session_id" });
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(ValidationError::TooLong {
                field: "session_id",
                max: MAX_SESSION_ID_LEN,
            });
        }
        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "session_id",
                reason: "only printable ASCII characters are allowed",
            });
        }
        Ok(Self(id))
    }

    /// Random session id (hyphenated UUID), as the HTTP trigger uses.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Queue (entity) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::Required { field: "queue_name" });
        }
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(ValidationError::TooLong {
                field: "queue_name",
                max: MAX_QUEUE_NAME_LEN,
            });
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/');
        if !name.chars().all(allowed) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name",
                reason: "only ASCII alphanumerics, '-', '_', '.' and '/' are allowed",
            });
        }
        if name.starts_with(['.', '/']) || name.ends_with(['.', '/']) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name",
                reason: "must not start or end with '.' or '/'",
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}
