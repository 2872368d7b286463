//! Implementations - ports の実装（開発・テスト用）

pub mod inmem_broker;
pub mod telemetry;

pub use inmem_broker::{BrokerOperation, InMemoryBroker, InMemoryBrokerOptions, QueueCounts};
pub use telemetry::{MetricsTelemetry, NoopTelemetry, RecordedException, RecordingTelemetry};
