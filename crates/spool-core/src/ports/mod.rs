//! Ports - 抽象化レイヤー
//!
//! 外部システム（broker, 時計, telemetry backend）へのインターフェース。
//! 実装は `impls` に置く。

pub mod broker;
pub mod clock;
pub mod telemetry;

pub use self::broker::{BrokerClient, SessionReceiver};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::telemetry::TelemetrySink;
