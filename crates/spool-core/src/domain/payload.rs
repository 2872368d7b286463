//! QueueTestMessage - HTTP トリガーが送るテスト用ペイロード
//!
//! ワイヤ上は `{"Body": "...", "SessionId": "..."}`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SessionId;

/// Timestamp format embedded in the body (`yyyy-MM-dd HH:mm:ss.fff`).
pub const BODY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTestMessage {
    #[serde(rename = "Body")]
    pub body: String,

    #[serde(rename = "SessionId")]
    pub session_id: String,
}

impl QueueTestMessage {
    /// Body of the form `Message{id}@{timestamp}`.
    pub fn new(id: u64, session_id: &SessionId, at: DateTime<Utc>) -> Self {
        Self {
            body: format!("Message{id}@{}", at.format(BODY_TIMESTAMP_FORMAT)),
            session_id: session_id.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
