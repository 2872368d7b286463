//! MessageHandler - ユーザーが登録するメッセージ処理
//!
//! dispatcher は 1 session につき 1 回に 1 メッセージだけ handler を呼ぶ。

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{CorrelationId, HandlerError, MessageType};

/// MessageHandler は受信メッセージを処理する
///
/// `Err` は dispatcher で分類され、complete / abandon / 再試行が決まる。
/// transient な失敗は `HandlerError::transient` で返す。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message_type: MessageType,
        correlation_id: CorrelationId,
        body: &str,
    ) -> Result<(), HandlerError>;
}

/// Closure adapter. The body is handed over as an owned `String`.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageType, CorrelationId, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageType, CorrelationId, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        message_type: MessageType,
        correlation_id: CorrelationId,
        body: &str,
    ) -> Result<(), HandlerError> {
        (self.0)(message_type, correlation_id, body.to_string()).await
    }
}
