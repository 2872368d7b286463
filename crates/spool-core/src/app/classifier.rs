//! ErrorClassifier - 配送中の失敗を ErrorKind に分類する純粋関数
//!
//! 判定順:
//! 1. broker が transient と報告したもの → Transient
//! 2. lock lost / timeout / server busy / quota exceeded → LockOrTimeout
//! 3. それ以外 → Fatal

use std::error::Error as StdError;

use crate::domain::{BrokerCondition, BrokerError, DispatchError, ErrorKind, HandlerError};

pub fn classify(error: &DispatchError) -> ErrorKind {
    match error {
        DispatchError::Handler(err) => classify_handler(err),
        DispatchError::Complete(err) => classify_broker(err),
        DispatchError::MissingProperty(_)
        | DispatchError::InvalidProperty { .. }
        | DispatchError::InvalidBody(_)
        | DispatchError::HandlerPanicked(_) => ErrorKind::Fatal,
    }
}

pub fn classify_broker(error: &BrokerError) -> ErrorKind {
    if error.is_transient() {
        return ErrorKind::Transient;
    }
    match error.condition() {
        BrokerCondition::MessageLockLost
        | BrokerCondition::SessionLockLost
        | BrokerCondition::Timeout
        | BrokerCondition::ServerBusy
        | BrokerCondition::QuotaExceeded => ErrorKind::LockOrTimeout,
        _ => ErrorKind::Fatal,
    }
}

pub fn classify_handler(error: &HandlerError) -> ErrorKind {
    match error {
        HandlerError::Broker(err) => classify_broker(err),
        HandlerError::Timeout(_) => ErrorKind::LockOrTimeout,
        HandlerError::Failed(_) => ErrorKind::Fatal,
        HandlerError::External { source, .. } => classify_source(source.as_ref()),
    }
}

/// Wrapped errors keep their broker classification; timed-out I/O counts as a timeout.
fn classify_source(source: &(dyn StdError + Send + Sync + 'static)) -> ErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(source);
    while let Some(err) = current {
        if let Some(broker) = err.downcast_ref::<BrokerError>() {
            return classify_broker(broker);
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::TimedOut
        {
            return ErrorKind::LockOrTimeout;
        }
        current = err.source();
    }
    ErrorKind::Fatal
}
