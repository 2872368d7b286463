//! InMemoryBroker - 開発・テスト用のセッション付きキュー
//!
//! # 実装詳細
//! - queue ごとに session → FIFO を保持
//! - session は 1 receiver だけが排他ロックできる（ロックには有効期限あり）
//! - abandon されたメッセージは delivery_count を保ったまま先頭に戻る
//!   （prefetch 済みの後続メッセージも一緒に戻すので追い越しは起きない）
//! - ロックは receive と renew_lock で延長される
//! - delivery_count が上限に達したら dead-letter
//! - scheduled メッセージは Clock が visible_at を過ぎるまで見えない
//! - prefetch したメッセージはロックを持ち、close 時に未処理分を戻す
//! - `fail_next` で任意の操作に 1 回だけ失敗を注入できる

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{
    BrokerError, BrokeredMessage, LockToken, LockedMessage, MessageEnvelope, MessageId, QueueName,
    SessionId,
};
use crate::ports::broker::DEFAULT_MAX_CONCURRENT_SESSIONS;
use crate::ports::{BrokerClient, Clock, SessionReceiver, SystemClock};

/// Deliveries allowed before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

pub const DEFAULT_SESSION_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Waiters re-check state at least this often (clock-driven visibility and
/// lock expiry do not notify).
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Operations that can be made to fail with [`InMemoryBroker::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Send,
    AcceptSession,
    Receive,
    Complete,
    Abandon,
    RenewLock,
    Close,
}

#[derive(Debug, Clone)]
pub struct InMemoryBrokerOptions {
    pub max_delivery_count: u32,
    pub session_lock_duration: Duration,
    /// Reported as the broker default for `max_concurrent_sessions = 0`.
    pub max_concurrent_sessions: usize,
}

impl Default for InMemoryBrokerOptions {
    fn default() -> Self {
        Self {
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            session_lock_duration: DEFAULT_SESSION_LOCK_DURATION,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
        }
    }
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Visible and waiting for a receiver.
    pub active: usize,
    /// Not yet visible (scheduled enqueue time in the future).
    pub scheduled: usize,
    /// Locked by a receiver (delivered or prefetched, not yet settled).
    pub locked: usize,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: usize,
}

struct StoredMessage {
    seq: u64,
    visible_at: DateTime<Utc>,
    message: BrokeredMessage,
}

struct SessionLock {
    receiver_id: u64,
    locked_until: DateTime<Utc>,
}

#[derive(Default)]
struct SessionState {
    /// Sorted by sequence number.
    pending: Vec<StoredMessage>,
    in_flight: HashMap<LockToken, StoredMessage>,
    lock: Option<SessionLock>,
}

impl SessionState {
    fn next_visible(&self, now: DateTime<Utc>) -> Option<usize> {
        self.pending.iter().position(|m| m.visible_at <= now)
    }

    fn lock_available(&self, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_none_or(|lock| lock.locked_until <= now)
    }

    fn restore(&mut self, stored: StoredMessage) {
        let pos = self.pending.partition_point(|m| m.seq < stored.seq);
        self.pending.insert(pos, stored);
    }

    /// Put a message back, or dead-letter it once it ran out of deliveries.
    fn release(
        &mut self,
        dead_letters: &mut Vec<BrokeredMessage>,
        stored: StoredMessage,
        max_delivery_count: u32,
    ) {
        if stored.message.delivery_count() >= max_delivery_count {
            debug!(
                message_id = %stored.message.message_id(),
                delivery_count = stored.message.delivery_count(),
                "message dead-lettered"
            );
            dead_letters.push(stored.message);
        } else {
            self.restore(stored);
        }
    }

    /// Drop the lock and return every unsettled message.
    fn unlock(&mut self, dead_letters: &mut Vec<BrokeredMessage>, max_delivery_count: u32) {
        self.lock = None;
        let unsettled: Vec<StoredMessage> = self.in_flight.drain().map(|(_, m)| m).collect();
        for stored in unsettled {
            self.release(dead_letters, stored, max_delivery_count);
        }
    }
}

#[derive(Default)]
struct QueueState {
    sessions: HashMap<SessionId, SessionState>,
    dead_letters: Vec<BrokeredMessage>,
    completed: u64,
    abandoned: u64,
}

impl QueueState {
    /// Session held by `receiver_id` with a live lock.
    ///
    /// An expired lock is released on the spot and reported as lost.
    fn held_session(
        &mut self,
        session_id: &SessionId,
        receiver_id: u64,
        now: DateTime<Utc>,
        max_delivery_count: u32,
    ) -> Result<&mut SessionState, BrokerError> {
        let lost = || BrokerError::session_lock_lost(format!("session '{session_id}' is no longer locked"));

        let session = self.sessions.get_mut(session_id).ok_or_else(lost)?;
        match &session.lock {
            Some(lock) if lock.receiver_id == receiver_id => {
                if lock.locked_until <= now {
                    session.unlock(&mut self.dead_letters, max_delivery_count);
                    return Err(lost());
                }
                Ok(session)
            }
            _ => Err(lost()),
        }
    }

    fn counts(&self, now: DateTime<Utc>) -> QueueCounts {
        let mut counts = QueueCounts {
            completed: self.completed,
            abandoned: self.abandoned,
            dead_lettered: self.dead_letters.len(),
            ..QueueCounts::default()
        };
        for session in self.sessions.values() {
            for stored in &session.pending {
                if stored.visible_at <= now {
                    counts.active += 1;
                } else {
                    counts.scheduled += 1;
                }
            }
            counts.locked += session.in_flight.len();
        }
        counts
    }
}

struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    faults: HashMap<BrokerOperation, VecDeque<BrokerError>>,
    next_seq: u64,
    next_receiver_id: u64,
}

impl BrokerState {
    fn take_fault(&mut self, op: BrokerOperation) -> Result<(), BrokerError> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, queue: &QueueName) -> Result<&mut QueueState, BrokerError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::entity_not_found(format!("queue '{queue}'")))
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    options: InMemoryBrokerOptions,
}

impl Inner {
    fn lock_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.options.session_lock_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// InMemoryBroker は開発用のセッション付きキュー
///
/// Clone は同じ broker を共有する。
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.create_queue(QueueName::new("orders")?).await;
/// let id = broker.send(&queue, envelope).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_options(clock, InMemoryBrokerOptions::default())
    }

    pub fn with_options(clock: Arc<dyn Clock>, options: InMemoryBrokerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    queues: HashMap::new(),
                    faults: HashMap::new(),
                    next_seq: 1,
                    next_receiver_id: 1,
                }),
                notify: Notify::new(),
                clock,
                options,
            }),
        }
    }

    /// Create the queue if it does not exist yet.
    pub async fn create_queue(&self, queue: QueueName) {
        let mut state = self.inner.state.lock().await;
        state.queues.entry(queue).or_default();
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per operation.
    pub async fn fail_next(&self, op: BrokerOperation, err: BrokerError) {
        let mut state = self.inner.state.lock().await;
        state.faults.entry(op).or_default().push_back(err);
    }

    /// Counts for one queue. Unknown queues read as empty.
    pub async fn counts(&self, queue: &QueueName) -> QueueCounts {
        let state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        state
            .queues
            .get(queue)
            .map(|q| q.counts(now))
            .unwrap_or_default()
    }

    pub async fn dead_letters(&self, queue: &QueueName) -> Vec<BrokeredMessage> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn send(&self, queue: &QueueName, envelope: MessageEnvelope) -> Result<MessageId, BrokerError> {
        let message_id = {
            let mut state = self.inner.state.lock().await;
            state.take_fault(BrokerOperation::Send)?;

            let now = self.inner.clock.now();
            let visible_at = envelope
                .scheduled_enqueue_time()
                .filter(|at| *at > now)
                .unwrap_or(now);
            let seq = state.next_seq;
            state.next_seq += 1;

            let q = state.queue_mut(queue)?;
            let message_id = MessageId::generate();
            let session_id = envelope.session_id().clone();
            let message = BrokeredMessage::new(message_id, envelope, visible_at);

            q.sessions.entry(session_id).or_default().pending.push(StoredMessage {
                seq,
                visible_at,
                message,
            });
            message_id
        };

        self.inner.notify.notify_waiters();
        debug!(queue = %queue, message_id = %message_id, "message enqueued");
        Ok(message_id)
    }

    async fn accept_next_session(
        &self,
        queue: &QueueName,
        prefetch_count: u32,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, BrokerError> {
        let deadline = Instant::now() + wait;
        let max_delivery_count = self.inner.options.max_delivery_count;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                state.take_fault(BrokerOperation::AcceptSession)?;

                let receiver_id = state.next_receiver_id;
                state.next_receiver_id += 1;
                let now = self.inner.clock.now();
                let locked_until = self.inner.lock_expiry(now);

                let q = state.queue_mut(queue)?;
                // Oldest visible message first across all lockable sessions.
                let candidate = q
                    .sessions
                    .iter()
                    .filter(|(_, session)| session.lock_available(now))
                    .filter_map(|(id, session)| {
                        session
                            .next_visible(now)
                            .map(|i| (session.pending[i].seq, id))
                    })
                    .min_by_key(|(seq, _)| *seq)
                    .map(|(_, id)| id.clone());

                if let Some(session_id) = candidate
                    && let Some(session) = q.sessions.get_mut(&session_id)
                {
                    if session.lock.is_some() {
                        // expired lock of a previous receiver
                        session.unlock(&mut q.dead_letters, max_delivery_count);
                    }
                    session.lock = Some(SessionLock {
                        receiver_id,
                        locked_until,
                    });
                    debug!(queue = %queue, session_id = %session_id, "session accepted");

                    return Ok(Some(Box::new(InMemorySessionReceiver {
                        inner: Arc::clone(&self.inner),
                        queue: queue.clone(),
                        session_id,
                        receiver_id,
                        prefetch_count,
                        buffer: std::sync::Mutex::new(VecDeque::new()),
                        closed: AtomicBool::new(false),
                    })));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let until = deadline.min(now + POLL_INTERVAL);
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    fn default_max_concurrent_sessions(&self) -> usize {
        self.inner.options.max_concurrent_sessions
    }
}

struct InMemorySessionReceiver {
    inner: Arc<Inner>,
    queue: QueueName,
    session_id: SessionId,
    receiver_id: u64,
    prefetch_count: u32,
    /// Prefetched lock tokens not yet handed out.
    buffer: std::sync::Mutex<VecDeque<LockToken>>,
    closed: AtomicBool,
}

impl InMemorySessionReceiver {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::session_lock_lost(format!(
                "receiver for session '{}' is closed",
                self.session_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionReceiver for InMemorySessionReceiver {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn receive(&self, wait: Duration) -> Result<Option<LockedMessage>, BrokerError> {
        self.ensure_open()?;
        let deadline = Instant::now() + wait;
        let max_delivery_count = self.inner.options.max_delivery_count;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                state.take_fault(BrokerOperation::Receive)?;
                let now = self.inner.clock.now();
                let locked_until = self.inner.lock_expiry(now);

                let session = state.queue_mut(&self.queue)?.held_session(
                    &self.session_id,
                    self.receiver_id,
                    now,
                    max_delivery_count,
                )?;
                if let Some(lock) = session.lock.as_mut() {
                    lock.locked_until = locked_until;
                }

                let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                if buffer.is_empty() {
                    for _ in 0..=self.prefetch_count {
                        let Some(i) = session.next_visible(now) else {
                            break;
                        };
                        let stored = session.pending.remove(i);
                        let token = LockToken::generate();
                        session.in_flight.insert(token, stored);
                        buffer.push_back(token);
                    }
                }

                while let Some(token) = buffer.pop_front() {
                    if let Some(stored) = session.in_flight.get_mut(&token) {
                        stored.message.mark_delivered();
                        return Ok(Some(LockedMessage::new(stored.message.clone(), token)));
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let until = deadline.min(now + POLL_INTERVAL);
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn complete(&self, lock_token: LockToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        state.take_fault(BrokerOperation::Complete)?;
        let now = self.inner.clock.now();

        let q = state.queue_mut(&self.queue)?;
        let session = q.held_session(
            &self.session_id,
            self.receiver_id,
            now,
            self.inner.options.max_delivery_count,
        )?;
        if session.in_flight.remove(&lock_token).is_none() {
            return Err(BrokerError::message_lock_lost(format!(
                "{lock_token} is not held"
            )));
        }
        q.completed += 1;
        Ok(())
    }

    async fn abandon(&self, lock_token: LockToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        {
            let mut state = self.inner.state.lock().await;
            state.take_fault(BrokerOperation::Abandon)?;
            let now = self.inner.clock.now();
            let max_delivery_count = self.inner.options.max_delivery_count;

            let q = state.queue_mut(&self.queue)?;
            q.held_session(&self.session_id, self.receiver_id, now, max_delivery_count)?;

            let QueueState {
                sessions,
                dead_letters,
                abandoned,
                ..
            } = q;
            let Some(session) = sessions.get_mut(&self.session_id) else {
                return Err(BrokerError::session_lock_lost(format!(
                    "session '{}' is no longer locked",
                    self.session_id
                )));
            };
            let Some(stored) = session.in_flight.remove(&lock_token) else {
                return Err(BrokerError::message_lock_lost(format!(
                    "{lock_token} is not held"
                )));
            };
            session.release(dead_letters, stored, max_delivery_count);
            *abandoned += 1;

            // Prefetched successors go back behind the abandoned message.
            let prefetched: Vec<LockToken> = self
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for token in prefetched {
                if let Some(stored) = session.in_flight.remove(&token) {
                    session.restore(stored);
                }
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn renew_lock(&self) -> Result<DateTime<Utc>, BrokerError> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        state.take_fault(BrokerOperation::RenewLock)?;
        let now = self.inner.clock.now();
        let locked_until = self.inner.lock_expiry(now);

        let session = state.queue_mut(&self.queue)?.held_session(
            &self.session_id,
            self.receiver_id,
            now,
            self.inner.options.max_delivery_count,
        )?;
        if let Some(lock) = session.lock.as_mut() {
            lock.locked_until = locked_until;
        }
        Ok(locked_until)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock().await;
            state.take_fault(BrokerOperation::Close)?;
            self.closed.store(true, Ordering::Release);
            self.buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();

            let max_delivery_count = self.inner.options.max_delivery_count;
            let q = state.queue_mut(&self.queue)?;
            if let Some(session) = q.sessions.get_mut(&self.session_id)
                && session
                    .lock
                    .as_ref()
                    .is_some_and(|lock| lock.receiver_id == self.receiver_id)
            {
                session.unlock(&mut q.dead_letters, max_delivery_count);
            }
        }
        self.inner.notify.notify_waiters();
        debug!(queue = %self.queue, session_id = %self.session_id, "session closed");
        Ok(())
    }
}
