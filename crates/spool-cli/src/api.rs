//! HTTP trigger - テスト用メッセージの送信と metrics の公開
//!
//! - `GET|POST /message`: 新しい session / correlation id で 1 件送る
//! - `GET /dummy`: downstream の呼び出し先（固定レスポンス）
//! - `GET /metrics`: Prometheus text format（telemetry 無効なら 404）

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use spool_core::domain::QueueTestMessage;
use spool_core::{CorrelationId, MessageType, QueueClient, SendError, SessionId};
use thiserror::Error;
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiState {
    pub client: QueueClient,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/message", get(send_message).post(send_message))
        .route("/dummy", get(dummy))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to send message: {0}")]
    Send(#[from] SendError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self, "message trigger failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

async fn send_message(State(state): State<ApiState>) -> Result<String, ApiError> {
    let session_id = SessionId::random();
    let correlation_id = CorrelationId::new();
    let body = QueueTestMessage::new(1, &session_id, Utc::now()).to_json()?;

    let message_id = state
        .client
        .send(
            MessageType::Message,
            body,
            session_id.as_str(),
            correlation_id,
            None,
        )
        .await?;

    info!(%message_id, %session_id, %correlation_id, "test message sent");
    Ok(format!("Message send: {correlation_id}"))
}

async fn dummy() -> &'static str {
    "test response"
}

async fn render_metrics(State(state): State<ApiState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
