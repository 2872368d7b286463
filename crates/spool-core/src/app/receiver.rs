//! Session workers - セッション単位の受信ループ
//!
//! - worker 数 = max_concurrent_sessions（0 なら broker の既定値）
//! - 各 worker は 1 度に 1 session だけをロックし、その中は逐次処理
//! - session が idle になったら close して次の session を取りに行く
//! - shutdown は watch channel で通知（処理中の handler は止めない）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::SessionDispatcher;
use crate::domain::QueueName;
use crate::ports::{BrokerClient, SessionReceiver};

/// Pause after a failed accept before asking the broker again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// 0 = broker default.
    pub max_concurrent_sessions: usize,
    /// 0 = no prefetch.
    pub prefetch_count: u32,
    /// How long one accept call waits for a session.
    pub accept_wait: Duration,
    /// A session with nothing to deliver for this long is released.
    pub session_idle_timeout: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 0,
            prefetch_count: 0,
            accept_wait: Duration::from_secs(1),
            session_idle_timeout: Duration::from_secs(1),
        }
    }
}

/// Handle of the running session workers.
/// - `request_shutdown()` で新しい session / メッセージの取得を止める
/// - `shutdown_and_join()` で全 worker の終了を待つ
pub struct ReceiverHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ReceiverHandle {
    pub(crate) fn spawn(
        broker: Arc<dyn BrokerClient>,
        queue: QueueName,
        dispatcher: Arc<SessionDispatcher>,
        options: ReceiverOptions,
    ) -> Self {
        let workers = match options.max_concurrent_sessions {
            0 => broker.default_max_concurrent_sessions().max(1),
            n => n,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(queue = %queue, workers, prefetch_count = options.prefetch_count, "message receiver registered");

        let joins = (0..workers)
            .map(|worker_id| {
                let worker = SessionWorker {
                    worker_id,
                    broker: Arc::clone(&broker),
                    queue: queue.clone(),
                    dispatcher: Arc::clone(&dispatcher),
                    options: options.clone(),
                };
                let rx = shutdown_rx.clone();
                tokio::spawn(worker.run(rx))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn worker_count(&self) -> usize {
        self.joins.len()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "session worker panicked");
            }
        }
    }
}

struct SessionWorker {
    worker_id: usize,
    broker: Arc<dyn BrokerClient>,
    queue: QueueName,
    dispatcher: Arc<SessionDispatcher>,
    options: ReceiverOptions,
}

impl SessionWorker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let worker_id = self.worker_id;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let accepted = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                accepted = self.broker.accept_next_session(
                    &self.queue,
                    self.options.prefetch_count,
                    self.options.accept_wait,
                ) => accepted,
            };

            let session = match accepted {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(err) => {
                    warn!(worker_id, queue = %self.queue, error = %err, "failed to accept session");
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            debug!(worker_id, session_id = %session.session_id(), "session locked");
            self.drain_session(session.as_ref(), &mut shutdown_rx).await;

            if let Err(err) = session.close().await {
                warn!(
                    worker_id,
                    session_id = %session.session_id(),
                    error = %err,
                    "failed to close session"
                );
            }
        }
        debug!(worker_id, "session worker stopped");
    }

    /// Deliver messages of one session in order until it goes idle.
    async fn drain_session(
        &self,
        session: &dyn SessionReceiver,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let received = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                received = session.receive(self.options.session_idle_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    let outcome = self.dispatcher.dispatch(session, &message, shutdown_rx).await;
                    debug!(
                        worker_id = self.worker_id,
                        session_id = %session.session_id(),
                        message_id = %message.message_id(),
                        outcome = ?outcome.kind,
                        retries = outcome.retries,
                        "delivery finished"
                    );
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(
                        worker_id = self.worker_id,
                        session_id = %session.session_id(),
                        error = %err,
                        "failed to receive from session"
                    );
                    return;
                }
            }
        }
    }
}
