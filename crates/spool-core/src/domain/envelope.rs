//! MessageEnvelope - キューに載る 1 件のメッセージ
//!
//! - `MessageEnvelope`: sender が組み立てる不変のメッセージ（body + properties）
//! - `BrokeredMessage`: broker が MessageId / enqueued_at / delivery_count を付与したもの
//! - `LockedMessage`: 配送 1 回分の lock token 付きメッセージ

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DispatchError;
use super::ids::{CorrelationId, LockToken, MessageId, SessionId};

/// User property carrying the integer message type.
pub const CONTENT_TYPE_PROPERTY: &str = "ContentType";

/// The type stamped on every message as the `ContentType` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MessageType {
    /// Generic message (code 0).
    Message,
    /// A code this build does not know; passed through to the handler.
    Other(i32),
}

impl MessageType {
    pub fn code(self) -> i32 {
        match self {
            MessageType::Message => 0,
            MessageType::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MessageType::Message,
            other => MessageType::Other(other),
        }
    }
}

impl From<i32> for MessageType {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl From<MessageType> for i32 {
    fn from(message_type: MessageType) -> Self {
        message_type.code()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Message => f.write_str("Message"),
            MessageType::Other(code) => write!(f, "Type{code}"),
        }
    }
}

/// 送信単位のメッセージ。構築後は不変。
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    body: Bytes,
    session_id: SessionId,
    correlation_id: Option<String>,
    scheduled_enqueue_time: Option<DateTime<Utc>>,
    user_properties: BTreeMap<String, serde_json::Value>,
}

impl MessageEnvelope {
    /// Envelope as the sender stamps it: type as a user property, the
    /// correlation id in its string form, the session as partition key.
    pub fn new(
        message_type: MessageType,
        body: impl Into<Bytes>,
        session_id: SessionId,
        correlation_id: CorrelationId,
    ) -> Self {
        Self::from_parts(body, session_id, Some(correlation_id.to_string()))
            .with_user_property(CONTENT_TYPE_PROPERTY, message_type.code())
    }

    /// Envelope with raw wire fields and no user properties, as a foreign
    /// producer may publish it.
    pub fn from_parts(
        body: impl Into<Bytes>,
        session_id: SessionId,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            body: body.into(),
            session_id,
            correlation_id,
            scheduled_enqueue_time: None,
            user_properties: BTreeMap::new(),
        }
    }

    /// Defer visibility until `at` (UTC).
    pub fn with_scheduled_enqueue_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_enqueue_time = Some(at);
        self
    }

    pub fn with_user_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.user_properties.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Correlation id exactly as it travels on the wire (may be malformed).
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn scheduled_enqueue_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled_enqueue_time
    }

    pub fn user_properties(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.user_properties
    }

    /// Read the `ContentType` user property.
    pub fn message_type(&self) -> Result<MessageType, DispatchError> {
        let value = self
            .user_properties
            .get(CONTENT_TYPE_PROPERTY)
            .ok_or(DispatchError::MissingProperty(CONTENT_TYPE_PROPERTY))?;

        value
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .map(MessageType::from_code)
            .ok_or_else(|| DispatchError::InvalidProperty {
                name: CONTENT_TYPE_PROPERTY,
                value: value.to_string(),
            })
    }
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokeredMessage {
    message_id: MessageId,
    envelope: MessageEnvelope,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
}

impl BrokeredMessage {
    pub fn new(message_id: MessageId, envelope: MessageEnvelope, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            envelope,
            enqueued_at,
            delivery_count: 0,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Number of times this message has been handed to a receiver.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Record one more hand-out to a receiver.
    pub fn mark_delivered(&mut self) {
        self.delivery_count += 1;
    }

    /// Seconds between enqueue and `now`. Negative clock skew reads as zero.
    pub fn seconds_queued(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now - self.enqueued_at;
        (elapsed.num_milliseconds().max(0) as f64) / 1000.0
    }
}

/// LockedMessage は 1 回の配送試行の間だけ存在する
///
/// complete / abandon には lock token が必要。
#[derive(Debug, Clone, PartialEq)]
pub struct LockedMessage {
    message: BrokeredMessage,
    lock_token: LockToken,
}

impl LockedMessage {
    pub fn new(message: BrokeredMessage, lock_token: LockToken) -> Self {
        Self {
            message,
            lock_token,
        }
    }

    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    pub fn message(&self) -> &BrokeredMessage {
        &self.message
    }

    pub fn into_message(self) -> BrokeredMessage {
        self.message
    }

    pub fn message_id(&self) -> MessageId {
        self.message.message_id
    }

    pub fn session_id(&self) -> &SessionId {
        self.message.envelope.session_id()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.envelope.correlation_id()
    }

    pub fn message_type(&self) -> Result<MessageType, DispatchError> {
        self.message.envelope.message_type()
    }

    pub fn body(&self) -> &Bytes {
        self.message.envelope.body()
    }

    /// Body decoded as UTF-8 text.
    pub fn body_text(&self) -> Result<&str, DispatchError> {
        Ok(std::str::from_utf8(self.body())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn session() -> SessionId {
        SessionId::new("s1").unwrap()
    }

    #[test]
    fn new_envelope_stamps_type_and_correlation() {
        let correlation_id = CorrelationId::new();
        let env = MessageEnvelope::new(MessageType::Message, "x", session(), correlation_id);

        assert_eq!(env.user_properties()[CONTENT_TYPE_PROPERTY], 0);
        assert_eq!(env.correlation_id(), Some(correlation_id.to_string().as_str()));
        assert_eq!(env.message_type().unwrap(), MessageType::Message);
        assert!(env.scheduled_enqueue_time().is_none());
    }

    #[rstest]
    #[case::message(0, MessageType::Message)]
    #[case::unknown(7, MessageType::Other(7))]
    fn message_type_codes(#[case] code: i32, #[case] expected: MessageType) {
        assert_eq!(MessageType::from_code(code), expected);
        assert_eq!(expected.code(), code);
        assert_eq!(serde_json::to_string(&expected).unwrap(), code.to_string());
    }

    #[test]
    fn missing_content_type_is_reported() {
        let env = MessageEnvelope::from_parts("x", session(), None);
        assert!(matches!(
            env.message_type(),
            Err(DispatchError::MissingProperty(CONTENT_TYPE_PROPERTY))
        ));
    }

    #[test]
    fn non_integer_content_type_is_reported() {
        let env = MessageEnvelope::from_parts("x", session(), None)
            .with_user_property(CONTENT_TYPE_PROPERTY, "zero");
        assert!(matches!(
            env.message_type(),
            Err(DispatchError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn seconds_queued_is_measured_from_enqueue_time() {
        let enqueued_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let msg = BrokeredMessage::new(
            MessageId::generate(),
            MessageEnvelope::from_parts("x", session(), None),
            enqueued_at,
        );

        let later = enqueued_at + chrono::Duration::milliseconds(2500);
        assert_eq!(msg.seconds_queued(later), 2.5);

        let earlier = enqueued_at - chrono::Duration::seconds(1);
        assert_eq!(msg.seconds_queued(earlier), 0.0);
    }

    #[test]
    fn invalid_utf8_body_is_reported() {
        let msg = BrokeredMessage::new(
            MessageId::generate(),
            MessageEnvelope::from_parts(vec![0xff, 0xfe], session(), None),
            Utc::now(),
        );
        let locked = LockedMessage::new(msg, LockToken::generate());
        assert!(matches!(locked.body_text(), Err(DispatchError::InvalidBody(_))));
    }
}
