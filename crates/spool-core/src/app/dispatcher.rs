//! SessionDispatcher - ロック済みメッセージ 1 件の配送
//!
//! 1 件ごとの流れ:
//! 1. correlation id を解決（不正なら新規発行して warn）
//! 2. ContentType と body を読み、seconds-queued をメトリクスに送る
//! 3. handler を呼び、成功したら complete
//! 4. 失敗は ErrorClassifier で分類
//!    - Transient: 同じロックのまま backoff 後に再試行
//!    - LockOrTimeout: abandon（再配送される）
//!    - Fatal: complete（捨てる）
//!
//! complete / abandon 自体の失敗はログに残して握りつぶす。
//! handler の panic は Fatal として扱い、worker は止めない。
//! handler 実行中は session ロックを定期的に延長する。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::classifier::classify;
use super::correlation::resolve_correlation_id;
use super::handler::MessageHandler;
use crate::domain::{
    CorrelationId, DeliveryOutcome, DispatchError, ErrorKind, LockedMessage, MessageType, OutcomeKind,
};
use crate::ports::{Clock, SessionReceiver, TelemetrySink};

/// Pause between in-place retries of a transient failure.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_millis(200);

/// Lower bound between two session lock renewals.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Metric and counter names, prefixed with the service name.
#[derive(Debug, Clone)]
pub struct MetricNames {
    pub seconds_queued: String,
    pub completed: String,
    pub abandoned: String,
    pub retried: String,
}

impl MetricNames {
    pub fn new(service_name: &str) -> Self {
        Self {
            seconds_queued: format!("{service_name}.MessageSecondsQueued"),
            completed: format!("{service_name}.MessagesCompleted"),
            abandoned: format!("{service_name}.MessagesAbandoned"),
            retried: format!("{service_name}.MessagesRetried"),
        }
    }
}

pub struct SessionDispatcher {
    handler: Arc<dyn MessageHandler>,
    telemetry: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    metrics: MetricNames,
    backoff: Duration,
}

impl SessionDispatcher {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        telemetry: Arc<dyn TelemetrySink>,
        clock: Arc<dyn Clock>,
        service_name: &str,
    ) -> Self {
        Self {
            handler,
            telemetry,
            clock,
            metrics: MetricNames::new(service_name),
            backoff: TRANSIENT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn metric_names(&self) -> &MetricNames {
        &self.metrics
    }

    /// Deliver one locked message until it is completed or abandoned.
    ///
    /// Never fails: every error ends in a terminal resolution. A shutdown
    /// signalled while waiting to retry abandons the message.
    pub async fn dispatch(
        &self,
        session: &dyn SessionReceiver,
        message: &LockedMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DeliveryOutcome {
        let correlation_id = resolve_correlation_id(message.correlation_id());
        let mut retries = 0;

        loop {
            let err = match self.try_deliver(session, message, correlation_id).await {
                Ok(()) => {
                    info!(
                        session_id = %session.session_id(),
                        message_id = %message.message_id(),
                        %correlation_id,
                        outcome = %OutcomeKind::Completed,
                        "Queue message completed."
                    );
                    self.telemetry.increment(&self.metrics.completed);
                    return DeliveryOutcome::completed(retries);
                }
                Err(err) => err,
            };

            match classify(&err) {
                ErrorKind::Transient => {
                    error!(
                        session_id = %session.session_id(),
                        message_id = %message.message_id(),
                        %correlation_id,
                        outcome = %OutcomeKind::Retried,
                        error = %err,
                        "Queue message is transient."
                    );
                    self.telemetry.increment(&self.metrics.retried);
                    retries += 1;

                    if !self.wait_backoff(shutdown).await {
                        self.abandon_after_error(session, message, correlation_id, ErrorKind::Transient, &err)
                            .await;
                        return DeliveryOutcome::abandoned(retries, ErrorKind::Transient);
                    }
                }
                ErrorKind::LockOrTimeout => {
                    self.abandon_after_error(session, message, correlation_id, ErrorKind::LockOrTimeout, &err)
                        .await;
                    return DeliveryOutcome::abandoned(retries, ErrorKind::LockOrTimeout);
                }
                ErrorKind::Fatal => {
                    self.complete_after_error(session, message, correlation_id, &err)
                        .await;
                    return DeliveryOutcome::completed_after_error(retries, ErrorKind::Fatal);
                }
            }
        }
    }

    async fn try_deliver(
        &self,
        session: &dyn SessionReceiver,
        message: &LockedMessage,
        correlation_id: CorrelationId,
    ) -> Result<(), DispatchError> {
        let message_type = message.message_type()?;
        let body = message.body_text()?;
        let seconds_queued = message.message().seconds_queued(self.clock.now());

        info!(
            %message_type,
            %correlation_id,
            seconds_queued,
            "Dequeueing {message_type} message"
        );
        self.telemetry
            .track_metric(&self.metrics.seconds_queued, seconds_queued);

        self.run_handler(session, message_type, correlation_id, body)
            .await?;

        session
            .complete(message.lock_token())
            .await
            .map_err(DispatchError::Complete)
    }

    /// Call the handler while keeping the session lock renewed.
    ///
    /// A panic inside the handler becomes [`DispatchError::HandlerPanicked`].
    async fn run_handler(
        &self,
        session: &dyn SessionReceiver,
        message_type: MessageType,
        correlation_id: CorrelationId,
        body: &str,
    ) -> Result<(), DispatchError> {
        let handled = AssertUnwindSafe(self.handler.handle(message_type, correlation_id, body)).catch_unwind();
        tokio::pin!(handled);
        let renewal = self.renew_lock_while_handling(session);
        tokio::pin!(renewal);

        let mut renewing = true;
        let result = loop {
            tokio::select! {
                biased;
                result = &mut handled => break result,
                () = &mut renewal, if renewing => renewing = false,
            }
        };

        match result {
            Ok(result) => result.map_err(DispatchError::Handler),
            Err(payload) => Err(DispatchError::HandlerPanicked(panic_message(payload.as_ref()))),
        }
    }

    /// Renew at half the remaining lock time. Returns only when a renewal fails.
    async fn renew_lock_while_handling(&self, session: &dyn SessionReceiver) {
        loop {
            let locked_until = match session.renew_lock().await {
                Ok(until) => until,
                Err(err) => {
                    warn!(
                        session_id = %session.session_id(),
                        error = %err,
                        "failed to renew session lock"
                    );
                    return;
                }
            };
            let remaining = (locked_until - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep((remaining / 2).max(MIN_RENEW_INTERVAL)).await;
        }
    }

    /// Sleep for the backoff unless shutdown arrives first.
    ///
    /// Returns `false` when cancelled. A dropped shutdown sender counts as cancellation.
    async fn wait_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + self.backoff;
        loop {
            if *shutdown.borrow_and_update() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn abandon_after_error(
        &self,
        session: &dyn SessionReceiver,
        message: &LockedMessage,
        correlation_id: CorrelationId,
        kind: ErrorKind,
        err: &DispatchError,
    ) {
        self.telemetry.track_exception(kind, err);

        match session.abandon(message.lock_token()).await {
            Ok(()) => {
                error!(
                    session_id = %session.session_id(),
                    message_id = %message.message_id(),
                    %correlation_id,
                    error_kind = %kind,
                    outcome = %OutcomeKind::Abandoned,
                    error = %err,
                    "Queue message abandoned after error."
                );
                self.telemetry.increment(&self.metrics.abandoned);
            }
            Err(abandon_err) => {
                error!(
                    session_id = %session.session_id(),
                    message_id = %message.message_id(),
                    %correlation_id,
                    error = %abandon_err,
                    "Exception while abandoning queue message after error."
                );
            }
        }
    }

    async fn complete_after_error(
        &self,
        session: &dyn SessionReceiver,
        message: &LockedMessage,
        correlation_id: CorrelationId,
        err: &DispatchError,
    ) {
        self.telemetry.track_exception(ErrorKind::Fatal, err);

        match session.complete(message.lock_token()).await {
            Ok(()) => {
                error!(
                    session_id = %session.session_id(),
                    message_id = %message.message_id(),
                    %correlation_id,
                    error_kind = %ErrorKind::Fatal,
                    outcome = %OutcomeKind::Completed,
                    error = %err,
                    "Queue message completed after error."
                );
                self.telemetry.increment(&self.metrics.completed);
            }
            Err(complete_err) => {
                error!(
                    session_id = %session.session_id(),
                    message_id = %message.message_id(),
                    %correlation_id,
                    error = %complete_err,
                    "Exception while completing queue message after error."
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler::handler_fn;
    use crate::domain::{
        BrokerError, HandlerError, MessageEnvelope, MessageType, OutcomeKind, QueueName, SessionId,
    };
    use crate::impls::{BrokerOperation, InMemoryBroker, InMemoryBrokerOptions, RecordingTelemetry};
    use crate::ports::{BrokerClient, FixedClock, SystemClock};
    use crate::test_support::CapturedLogs;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_millis(200);

    struct Fixture {
        broker: InMemoryBroker,
        queue: QueueName,
        telemetry: Arc<RecordingTelemetry>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_clock(Arc::new(SystemClock)).await
        }

        async fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self::with_options(clock, InMemoryBrokerOptions::default()).await
        }

        async fn with_options(clock: Arc<dyn Clock>, options: InMemoryBrokerOptions) -> Self {
            let broker = InMemoryBroker::with_options(clock, options);
            let queue = QueueName::new("q").unwrap();
            broker.create_queue(queue.clone()).await;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            Self {
                broker,
                queue,
                telemetry: Arc::new(RecordingTelemetry::new()),
                shutdown_tx,
                shutdown_rx,
            }
        }

        fn dispatcher(&self, handler: impl MessageHandler + 'static, clock: Arc<dyn Clock>) -> SessionDispatcher {
            SessionDispatcher::new(Arc::new(handler), self.telemetry.clone(), clock, "svc")
        }

        async fn send(&self, envelope: MessageEnvelope) {
            self.broker.send(&self.queue, envelope).await.unwrap();
        }

        async fn lock_next(&self) -> (Box<dyn SessionReceiver>, LockedMessage) {
            let session = self
                .broker
                .accept_next_session(&self.queue, 0, WAIT)
                .await
                .unwrap()
                .unwrap();
            let message = session.receive(WAIT).await.unwrap().unwrap();
            (session, message)
        }
    }

    fn envelope(body: &str, correlation_id: CorrelationId) -> MessageEnvelope {
        MessageEnvelope::new(
            MessageType::Message,
            body.to_string(),
            SessionId::new("s1").unwrap(),
            correlation_id,
        )
    }

    #[tokio::test]
    async fn success_completes_and_logs_correlation() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        let c1 = CorrelationId::new();
        fx.send(envelope("x", c1)).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = fx.dispatcher(
            handler_fn({
                let seen = Arc::clone(&seen);
                move |message_type, correlation_id, body: String| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push((message_type, correlation_id, body));
                        Ok(())
                    }
                }
            }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed(0));
        assert_eq!(*seen.lock().unwrap(), vec![(MessageType::Message, c1, "x".to_string())]);
        assert_eq!(fx.broker.counts(&fx.queue).await.completed, 1);
        assert_eq!(fx.telemetry.counter("svc.MessagesCompleted"), 1);

        let completed = logs.with_message("Queue message completed.");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].field("correlation_id"), Some(c1.to_string()));
        assert_eq!(completed[0].field("session_id"), Some("s1".to_string()));
        assert_eq!(
            completed[0].field("message_id"),
            Some(message.message_id().to_string())
        );
    }

    #[tokio::test]
    async fn seconds_queued_is_reported_from_the_clock() {
        let start = Utc::now();
        let clock = Arc::new(FixedClock::new(start));
        let mut fx = Fixture::with_clock(clock.clone()).await;
        fx.send(envelope("x", CorrelationId::new())).await;
        clock.advance(chrono::Duration::milliseconds(1500));

        let dispatcher = fx.dispatcher(handler_fn(|_, _, _| async { Ok(()) }), clock.clone());
        let (session, message) = fx.lock_next().await;
        dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(fx.telemetry.metric("svc.MessageSecondsQueued"), vec![1.5]);
    }

    #[tokio::test]
    async fn malformed_correlation_is_replaced_once_per_delivery() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        let raw = MessageEnvelope::from_parts("x", SessionId::new("s1").unwrap(), Some("not-a-guid".into()))
            .with_user_property(crate::domain::CONTENT_TYPE_PROPERTY, 0);
        fx.send(raw).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = fx
            .dispatcher(
                handler_fn({
                    let attempts = Arc::clone(&attempts);
                    let seen = Arc::clone(&seen);
                    move |_, correlation_id, _| {
                        let attempts = Arc::clone(&attempts);
                        let seen = Arc::clone(&seen);
                        async move {
                            seen.lock().unwrap().push(correlation_id);
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(HandlerError::transient("blip"))
                            } else {
                                Ok(())
                            }
                        }
                    }
                }),
                Arc::new(SystemClock),
            )
            .with_backoff(Duration::from_millis(10));

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome.kind, OutcomeKind::Completed);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        let warnings = logs.at_level(tracing::Level::WARN);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field("correlation_id"), Some(seen[0].to_string()));
    }

    #[tokio::test]
    async fn transient_failures_retry_in_place_with_backoff() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = fx.dispatcher(
            handler_fn({
                let calls = Arc::clone(&calls);
                move |_, _, _| {
                    let calls = Arc::clone(&calls);
                    async move {
                        let mut calls = calls.lock().unwrap();
                        calls.push(std::time::Instant::now());
                        if calls.len() < 3 {
                            Err(HandlerError::transient("connection reset"))
                        } else {
                            Ok(())
                        }
                    }
                }
            }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed(2));
        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= TRANSIENT_BACKOFF);
        }

        // Same lock all along: nothing was abandoned or redelivered.
        let counts = fx.broker.counts(&fx.queue).await;
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.abandoned, 0);
        let transient = logs.with_message("Queue message is transient.");
        assert_eq!(transient.len(), 2);
        assert!(transient.iter().all(|e| e.field("outcome") == Some("RETRIED".to_string())));
        assert_eq!(fx.telemetry.counter("svc.MessagesRetried"), 2);
        assert_eq!(
            outcome.attempts(),
            [OutcomeKind::Retried, OutcomeKind::Retried, OutcomeKind::Completed]
        );
    }

    #[tokio::test]
    async fn panicking_handler_completes_after_error() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        fx.send(envelope("boom", CorrelationId::new())).await;

        let dispatcher = fx.dispatcher(
            handler_fn(|_, _, body: String| async move {
                if body == "boom" {
                    panic!("handler blew up");
                }
                Ok(())
            }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed_after_error(0, ErrorKind::Fatal));
        assert_eq!(fx.broker.counts(&fx.queue).await.completed, 1);
        let logged = logs.with_message("Queue message completed after error.");
        assert_eq!(logged.len(), 1);
        assert_eq!(
            logged[0].field("error"),
            Some("handler panicked: handler blew up".to_string())
        );
    }

    #[tokio::test]
    async fn long_handler_keeps_the_session_lock() {
        let options = InMemoryBrokerOptions {
            session_lock_duration: Duration::from_secs(2),
            ..InMemoryBrokerOptions::default()
        };
        let mut fx = Fixture::with_options(Arc::new(SystemClock), options).await;
        fx.send(envelope("slow", CorrelationId::new())).await;

        let dispatcher = fx.dispatcher(
            handler_fn(|_, _, _| async {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                Ok(())
            }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed(0));
        let counts = fx.broker.counts(&fx.queue).await;
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.abandoned, 0);
    }

    #[tokio::test]
    async fn transient_then_fatal_completes_after_error() {
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = fx
            .dispatcher(
                handler_fn({
                    let attempts = Arc::clone(&attempts);
                    move |_, _, _| {
                        let attempts = Arc::clone(&attempts);
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(HandlerError::transient("blip"))
                            } else {
                                Err(HandlerError::failed("bad data"))
                            }
                        }
                    }
                }),
                Arc::new(SystemClock),
            )
            .with_backoff(Duration::from_millis(10));

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed_after_error(1, ErrorKind::Fatal));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lock_or_timeout_abandons_and_never_completes() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;

        let dispatcher = fx.dispatcher(
            handler_fn(|_, _, _| async { Err(HandlerError::Timeout("downstream".into())) }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::abandoned(0, ErrorKind::LockOrTimeout));
        let counts = fx.broker.counts(&fx.queue).await;
        assert_eq!(counts.abandoned, 1);
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.active, 1);

        assert_eq!(logs.with_message("Queue message abandoned after error.").len(), 1);
        assert!(logs.with_message("Queue message completed.").is_empty());
        let exceptions = fx.telemetry.exceptions();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].kind, ErrorKind::LockOrTimeout);
    }

    #[tokio::test]
    async fn unclassified_failure_completes_and_is_not_redelivered() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;

        let dispatcher = fx.dispatcher(
            handler_fn(|_, _, _| async { Err(HandlerError::failed("boom")) }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed_after_error(0, ErrorKind::Fatal));
        let counts = fx.broker.counts(&fx.queue).await;
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);

        let logged = logs.with_message("Queue message completed after error.");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].level, tracing::Level::ERROR);
        assert_eq!(logged[0].field("error"), Some("handler failed: boom".to_string()));
        assert_eq!(fx.telemetry.exceptions()[0].kind, ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn missing_content_type_is_fatal() {
        let mut fx = Fixture::new().await;
        fx.send(MessageEnvelope::from_parts(
            "x",
            SessionId::new("s1").unwrap(),
            Some(CorrelationId::new().to_string()),
        ))
        .await;

        let called = Arc::new(AtomicUsize::new(0));
        let dispatcher = fx.dispatcher(
            handler_fn({
                let called = Arc::clone(&called);
                move |_, _, _| {
                    let called = Arc::clone(&called);
                    async move {
                        called.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            }),
            Arc::new(SystemClock),
        );

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome.failure, Some(ErrorKind::Fatal));
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(fx.broker.counts(&fx.queue).await.completed, 1);
    }

    #[tokio::test]
    async fn lock_lost_on_complete_abandons() {
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;
        fx.broker
            .fail_next(BrokerOperation::Complete, BrokerError::message_lock_lost("expired"))
            .await;

        let dispatcher = fx.dispatcher(handler_fn(|_, _, _| async { Ok(()) }), Arc::new(SystemClock));
        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::abandoned(0, ErrorKind::LockOrTimeout));
        assert_eq!(fx.broker.counts(&fx.queue).await.abandoned, 1);
    }

    #[tokio::test]
    async fn transient_complete_failure_reinvokes_handler() {
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;
        fx.broker
            .fail_next(BrokerOperation::Complete, BrokerError::transient("reset"))
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = fx
            .dispatcher(
                handler_fn({
                    let calls = Arc::clone(&calls);
                    move |_, _, _| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }
                }),
                Arc::new(SystemClock),
            )
            .with_backoff(Duration::from_millis(10));

        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome, DeliveryOutcome::completed(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_while_settling_is_logged_and_swallowed() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;
        fx.broker
            .fail_next(BrokerOperation::Abandon, BrokerError::server_busy("try later"))
            .await;

        let dispatcher = fx.dispatcher(
            handler_fn(|_, _, _| async { Err(HandlerError::Timeout("slow".into())) }),
            Arc::new(SystemClock),
        );
        let (session, message) = fx.lock_next().await;
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert_eq!(outcome.kind, OutcomeKind::Abandoned);
        assert_eq!(
            logs.with_message("Exception while abandoning queue message after error.").len(),
            1
        );
        assert!(logs.with_message("Queue message abandoned after error.").is_empty());
    }

    #[tokio::test]
    async fn shutdown_during_backoff_abandons_the_message() {
        let mut fx = Fixture::new().await;
        fx.send(envelope("x", CorrelationId::new())).await;

        let dispatcher = fx
            .dispatcher(
                handler_fn(|_, _, _| async { Err(HandlerError::transient("down")) }),
                Arc::new(SystemClock),
            )
            .with_backoff(Duration::from_secs(30));

        let shutdown_tx = fx.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown_tx.send(true);
        });

        let (session, message) = fx.lock_next().await;
        let started = std::time::Instant::now();
        let outcome = dispatcher
            .dispatch(session.as_ref(), &message, &mut fx.shutdown_rx)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome, DeliveryOutcome::abandoned(1, ErrorKind::Transient));
        let counts = fx.broker.counts(&fx.queue).await;
        assert_eq!(counts.abandoned, 1);
        assert_eq!(counts.active, 1);
    }
}
