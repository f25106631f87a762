//! Queue engine.
//!
//! A [`Queue`] owns its message buffer and the counters derived from it.
//! Producers and the delivery worker never share a lock on the hot path:
//! - the buffer is a lock-free `SegQueue`,
//! - a counting semaphore carries one permit per buffered message,
//! - flow control is a separate single-permit `Notify`, so a queue that drops
//!   back under its limit releases one blocked sender at a time.
//!
//! Senders claim room with [`Queue::try_reserve`] before they enqueue. The
//! limit check and the claim happen under one short admission lock, so
//! concurrent senders cannot all pass the check and overshoot the limit.

pub mod limit;

pub use limit::{LimitExceeded, LimitKind, LimitStrategy, QueueLimit};

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::trace;

use crate::core::error::BrokerError;
use crate::core::message::{Message, Persistence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueStatus {
    Starting = 0,
    Started = 1,
    Clearing = 2,
    Deleting = 3,
    Deleted = 4,
}

impl QueueStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueueStatus::Starting,
            1 => QueueStatus::Started,
            2 => QueueStatus::Clearing,
            3 => QueueStatus::Deleting,
            _ => QueueStatus::Deleted,
        }
    }

    fn can_transition_to(self, next: QueueStatus) -> bool {
        match self {
            QueueStatus::Deleted => false,
            QueueStatus::Deleting => next == QueueStatus::Deleted,
            _ => true,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Deleting | QueueStatus::Deleted)
    }
}

/// Static part of a queue definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exchange: bool,
    pub limit: Option<QueueLimit>,
}

/// Point-in-time view of a queue, returned by `GetQueue`/`SearchQueues`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub user: String,
    pub name: String,
    pub options: QueueOptions,
    pub status: QueueStatus,
    pub length: u64,
    pub volume: u64,
    pub memory_volume: u64,
    pub subscriptions: usize,
    pub forced_limit: Option<u64>,
}

#[derive(Debug)]
pub struct Queue {
    user: String,
    name: String,
    options: QueueOptions,
    status: AtomicU8,
    /// Memory-pressure cap on length; 0 means none.
    forced_limit: AtomicU64,

    buffer: SegQueue<Message>,
    available: Semaphore,
    flow: Notify,
    flow_waiters: AtomicUsize,
    admission: Mutex<()>,

    length: AtomicU64,
    volume: AtomicU64,
    memory_volume: AtomicU64,
    /// Admitted sends not yet enqueued; counted against every limit.
    reserved_length: AtomicU64,
    reserved_volume: AtomicU64,
    subscriptions: AtomicUsize,
}

impl Queue {
    /// Creates a queue in `Starting` state.
    pub fn new(user: impl Into<String>, name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
            options,
            status: AtomicU8::new(QueueStatus::Starting as u8),
            forced_limit: AtomicU64::new(0),
            buffer: SegQueue::new(),
            available: Semaphore::new(0),
            flow: Notify::new(),
            flow_waiters: AtomicUsize::new(0),
            admission: Mutex::new(()),
            length: AtomicU64::new(0),
            volume: AtomicU64::new(0),
            memory_volume: AtomicU64::new(0),
            reserved_length: AtomicU64::new(0),
            reserved_volume: AtomicU64::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[inline]
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.options.durable
    }

    #[inline]
    pub fn is_exchange(&self) -> bool {
        self.options.exchange
    }

    #[inline]
    pub fn limit(&self) -> Option<QueueLimit> {
        self.options.limit
    }

    #[inline]
    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.status() == QueueStatus::Started
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn volume(&self) -> u64 {
        self.volume.load(Ordering::Acquire)
    }

    #[inline]
    pub fn memory_volume(&self) -> u64 {
        self.memory_volume.load(Ordering::Acquire)
    }

    #[inline]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Acquire)
    }

    pub(crate) fn add_subscription(&self) {
        self.subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_subscription(&self) {
        let _ = self
            .subscriptions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Single-writer status transition. Returns `false` when the transition is
    /// not allowed (nothing leaves `Deleted`, `Deleting` only goes to `Deleted`).
    pub fn set_status(&self, next: QueueStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if !QueueStatus::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.status.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if next.is_terminal() {
            // Wake every dequeuer and blocked sender; they re-check the status.
            self.available.close();
            self.flow.notify_waiters();
        }
        trace!(target: "relaymq::queue", queue = %self.name, status = ?next, "status changed");
        true
    }

    /// Appends a message at the tail and signals one waiting dequeuer.
    pub fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        if !self.is_started() {
            return Err(BrokerError::QueueStopped(self.name.clone()));
        }
        if self.options.exchange {
            return Err(BrokerError::QueueIsExchange(self.name.clone()));
        }

        // Counters move before the push so a concurrent pop never underflows.
        let size = message.size;
        self.volume.fetch_add(size, Ordering::AcqRel);
        if message.persistence != Persistence::DiskOnly {
            self.memory_volume.fetch_add(size, Ordering::AcqRel);
        }
        self.length.fetch_add(1, Ordering::AcqRel);

        self.buffer.push(message);
        self.available.add_permits(1);
        Ok(())
    }

    /// Waits up to `timeout` for a message.
    ///
    /// Returns `None` on timeout or once the queue has been shut down.
    pub async fn try_dequeue(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let permit = match tokio::time::timeout_at(deadline, self.available.acquire()).await {
                Ok(Ok(permit)) => permit,
                // Timed out, or the semaphore was closed by a terminal status.
                Ok(Err(_)) | Err(_) => return None,
            };
            permit.forget();

            // A permit without a message means `clear` won the race; wait again.
            if let Some(message) = self.buffer.pop() {
                self.account_removed(&message);
                self.on_drained();
                return Some(message);
            }
        }
    }

    /// Pops the head without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        let message = self.buffer.pop()?;
        self.account_removed(&message);
        self.on_drained();
        Some(message)
    }

    fn account_removed(&self, message: &Message) {
        let size = message.size;
        self.length.fetch_sub(1, Ordering::AcqRel);
        self.volume.fetch_sub(size, Ordering::AcqRel);
        if message.persistence != Persistence::DiskOnly {
            self.memory_volume.fetch_sub(size, Ordering::AcqRel);
        }
    }

    fn on_drained(&self) {
        let forced = self.forced_limit.load(Ordering::Acquire);
        if forced > 0 && self.len() < forced {
            let _ = self
                .forced_limit
                .compare_exchange(forced, 0, Ordering::AcqRel, Ordering::Acquire);
        }
        self.release_flow_waiter();
    }

    /// Evaluates the static limit and the forced cap against one more message
    /// of `additional_bytes`. Outstanding reservations count as buffered.
    pub fn limit_exceeded(&self, additional_bytes: u64) -> LimitExceeded {
        let length = self.len() + self.reserved_length.load(Ordering::Acquire);
        let volume = self.volume() + self.reserved_volume.load(Ordering::Acquire);
        let forced = self.forced_limit.load(Ordering::Acquire);
        if forced > 0 && length >= forced {
            return LimitExceeded::Length;
        }

        match self.options.limit.map(|l| l.kind) {
            Some(LimitKind::Length(max)) if length >= max => LimitExceeded::Length,
            Some(LimitKind::Volume(max)) if volume + additional_bytes > max => {
                LimitExceeded::Volume
            }
            _ => LimitExceeded::None,
        }
    }

    /// Claims room for one message of `size` bytes if no limit would be
    /// exceeded. The claim is released when the [`Reservation`] is committed
    /// or dropped.
    pub fn try_reserve(self: &Arc<Self>, size: u64) -> Result<Reservation, LimitExceeded> {
        let _admission = self.admission.lock();
        let exceeded = self.limit_exceeded(size);
        if exceeded.is_exceeded() {
            return Err(exceeded);
        }
        self.reserved_length.fetch_add(1, Ordering::AcqRel);
        self.reserved_volume.fetch_add(size, Ordering::AcqRel);
        Ok(Reservation {
            queue: Arc::clone(self),
            size,
        })
    }

    pub fn forced_limit(&self) -> Option<u64> {
        match self.forced_limit.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Installs a forced length cap unless one is already set.
    pub(crate) fn force_limit(&self, cap: u64) -> bool {
        self.forced_limit
            .compare_exchange(0, cap.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drops the forced cap after memory pressure has cleared.
    pub(crate) fn lift_forced_limit(&self) {
        if self.forced_limit.swap(0, Ordering::AcqRel) > 0 {
            self.release_flow_waiter();
        }
    }

    /// Blocks until a flow-control release or `deadline`. Returns `false` on
    /// timeout.
    pub async fn wait_for_capacity(&self, additional_bytes: u64, deadline: Instant) -> bool {
        self.flow_waiters.fetch_add(1, Ordering::AcqRel);
        let notified = self.flow.notified();
        let released = if !self.limit_exceeded(additional_bytes).is_exceeded() {
            true
        } else {
            tokio::time::timeout_at(deadline, notified).await.is_ok()
        };
        self.flow_waiters.fetch_sub(1, Ordering::AcqRel);
        released
    }

    /// Releases exactly one blocked sender if the queue is under its limit.
    pub fn release_flow_waiter(&self) {
        if self.flow_waiters.load(Ordering::Acquire) > 0
            && !self.limit_exceeded(0).is_exceeded()
        {
            self.flow.notify_one();
        }
    }

    /// Discards every buffered message and returns them.
    pub fn clear(&self) -> Vec<Message> {
        let mut drained = Vec::new();
        while let Some(message) = self.buffer.pop() {
            if let Ok(permit) = self.available.try_acquire() {
                permit.forget();
            }
            self.account_removed(&message);
            drained.push(message);
        }
        self.forced_limit.store(0, Ordering::Release);
        self.release_flow_waiter();
        drained
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            user: self.user.clone(),
            name: self.name.clone(),
            options: self.options,
            status: self.status(),
            length: self.len(),
            volume: self.volume(),
            memory_volume: self.memory_volume(),
            subscriptions: self.subscription_count(),
            forced_limit: self.forced_limit(),
        }
    }
}

/// Room claimed in a queue between admission and enqueue.
#[derive(Debug)]
pub struct Reservation {
    queue: Arc<Queue>,
    size: u64,
}

impl Reservation {
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Enqueues `message` into the claimed slot.
    pub fn commit(self, message: Message) -> Result<(), BrokerError> {
        // The claim is dropped after the counters moved, never before.
        self.queue.enqueue(message)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.queue.reserved_length.fetch_sub(1, Ordering::AcqRel);
        self.queue
            .reserved_volume
            .fetch_sub(self.size, Ordering::AcqRel);
        self.queue.release_flow_waiter();
    }
}
