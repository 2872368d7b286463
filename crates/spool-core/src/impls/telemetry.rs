//! TelemetrySink の実装
//!
//! - `MetricsTelemetry`: `metrics` facade へ転送（recorder はバイナリ側で install）
//! - `NoopTelemetry`: telemetry 無効時
//! - `RecordingTelemetry`: テスト用にメモリへ記録

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};

use metrics::{counter, histogram};

use crate::domain::ErrorKind;
use crate::ports::TelemetrySink;

/// Forwards to the global `metrics` recorder.
#[derive(Debug, Clone)]
pub struct MetricsTelemetry {
    exceptions_metric: String,
}

impl MetricsTelemetry {
    pub fn new(service_name: &str) -> Self {
        Self {
            exceptions_metric: format!("{service_name}.Exceptions"),
        }
    }
}

impl TelemetrySink for MetricsTelemetry {
    fn track_metric(&self, name: &str, value: f64) {
        histogram!(name.to_string()).record(value);
    }

    fn increment(&self, name: &str) {
        counter!(name.to_string()).increment(1);
    }

    fn track_exception(&self, kind: ErrorKind, _error: &(dyn StdError + 'static)) {
        counter!(self.exceptions_metric.clone(), "kind" => kind.as_str()).increment(1);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn track_metric(&self, _name: &str, _value: f64) {}

    fn increment(&self, _name: &str) {}

    fn track_exception(&self, _kind: ErrorKind, _error: &(dyn StdError + 'static)) {}
}

/// One reported exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedException {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Default)]
struct Recorded {
    metrics: Vec<(String, f64)>,
    counters: HashMap<String, u64>,
    exceptions: Vec<RecordedException>,
}

/// Keeps everything in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    recorded: Mutex<Recorded>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples recorded under `name`, in order.
    pub fn metric(&self, name: &str) -> Vec<f64> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn exceptions(&self) -> Vec<RecordedException> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exceptions
            .clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn track_metric(&self, name: &str, value: f64) {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .push((name.to_string(), value));
    }

    fn increment(&self, name: &str) {
        *self
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counters
            .entry(name.to_string())
            .or_default() += 1;
    }

    fn track_exception(&self, kind: ErrorKind, error: &(dyn StdError + 'static)) {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exceptions
            .push(RecordedException {
                kind,
                message: error.to_string(),
            });
    }
}
