//! Application layer - 送信・受信・分類のロジック
//!
//! - **correlation**: correlation id の解決
//! - **classifier**: 失敗 → ErrorKind
//! - **sender**: 送信
//! - **dispatcher**: 1 メッセージの配送（complete / 再試行 / abandon）
//! - **receiver**: session worker プール
//! - **builder**: QueueClient の構築
//! - **settings**: 接続設定

pub mod builder;
pub mod classifier;
pub mod correlation;
pub mod dispatcher;
pub mod handler;
pub mod receiver;
pub mod sender;
pub mod settings;

pub use builder::{BuildError, QueueClient, QueueClientBuilder};
pub use classifier::{classify, classify_broker, classify_handler};
pub use correlation::resolve_correlation_id;
pub use dispatcher::{SessionDispatcher, TRANSIENT_BACKOFF};
pub use handler::{FnHandler, MessageHandler, handler_fn};
pub use receiver::{ReceiverHandle, ReceiverOptions};
pub use sender::Sender;
pub use settings::{ConnectionString, ServiceBusConfig, ServiceBusSettings, SettingsError};
