//! TelemetrySink port - メトリクスと例外の送信先

use std::error::Error as StdError;

use crate::domain::ErrorKind;

/// 数値メトリクスと例外を受け取る sink
///
/// 実装は Send + Sync で、全 session worker から共有される。
pub trait TelemetrySink: Send + Sync {
    /// Record one sample of a named metric.
    fn track_metric(&self, name: &str, value: f64);

    /// Add one to a named counter.
    fn increment(&self, name: &str);

    /// Report a failure caught at the dispatch boundary.
    fn track_exception(&self, kind: ErrorKind, error: &(dyn StdError + 'static));
}
