//! spool-core
//!
//! Session-scoped queue delivery: a sender that publishes typed envelopes and
//! a receiver that locks sessions, dispatches to a handler and settles each
//! message according to how it failed.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, payload, outcome, errors）
//! - **ports**: 抽象化レイヤー（BrokerClient, SessionReceiver, Clock, TelemetrySink）
//! - **app**: アプリケーションロジック（sender, dispatcher, classifier, builder, ...）
//! - **impls**: 実装（InMemoryBroker, telemetry sinks）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::{
    BuildError, MessageHandler, QueueClient, QueueClientBuilder, ReceiverHandle,
    ServiceBusSettings, handler_fn,
};
pub use domain::{
    CorrelationId, DeliveryOutcome, ErrorKind, HandlerError, MessageId, MessageType, OutcomeKind,
    QueueName, SendError, SessionId,
};
