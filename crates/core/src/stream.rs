//! Bounded queue carrying pushed stream events from upstream subscriptions to
//! the provider's consumer task.
//!
//! When the queue is full the oldest data event is dropped to make room.
//! Control events (disconnect notices) are never dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::models::CandleRecord;
use crate::snapshot::{DataType, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Snapshot(Snapshot),
    Candle(CandleRecord),
    /// The subscription carrying `data_type` for `symbols` stopped delivering.
    Disconnected {
        data_type: DataType,
        symbols: Vec<String>,
        reason: String,
    },
}

impl StreamEvent {
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest data event.
    DroppedOldest,
    /// Queue held only control events; the incoming data event was discarded.
    DroppedIncoming,
    Closed,
}

struct Shared {
    queue: Mutex<VecDeque<StreamEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Producer half. Cheap to clone; one clone per subscription.
#[derive(Clone)]
pub struct StreamSink {
    shared: Arc<Shared>,
}

/// Consumer half.
pub struct StreamReceiver {
    shared: Arc<Shared>,
}

/// Creates a queue holding at most `capacity` events (minimum 1).
#[must_use]
pub fn stream_queue(capacity: usize) -> (StreamSink, StreamReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        capacity: capacity.max(1),
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    (
        StreamSink {
            shared: Arc::clone(&shared),
        },
        StreamReceiver { shared },
    )
}

impl StreamSink {
    pub fn push(&self, event: StreamEvent) -> PushOutcome {
        if self.shared.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut queue = self.shared.queue.lock();
            let mut outcome = PushOutcome::Queued;
            if queue.len() >= self.shared.capacity {
                match queue.iter().position(|e| !e.is_control()) {
                    Some(index) => {
                        queue.remove(index);
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        outcome = PushOutcome::DroppedOldest;
                    }
                    None if !event.is_control() => {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        return PushOutcome::DroppedIncoming;
                    }
                    None => {}
                }
            }
            queue.push_back(event);
            outcome
        };

        self.shared.notify.notify_one();
        outcome
    }

    /// Stops accepting events and wakes the receiver. Already queued events
    /// can still be drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamReceiver {
    /// Waits for the next event. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<StreamEvent> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.shared.queue.lock().pop_front() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.shared.queue.lock().pop_front()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
