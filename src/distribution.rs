//! Per-session outbound queues with backpressure policy.
//!
//! Fan-out must never let a slow client touch the acquisition loop, so each
//! session owns one [`OutboundQueue`]: the producer side is a synchronous,
//! non-blocking `push` (callable straight from the loop's task), the consumer
//! side is an async `drain` awaited by that session's socket writer.
//!
//! Two backpressure layers, per policy:
//!
//! - **soft**: a full queue drops its oldest entry and records the drop; the
//!   next drain emits one coalesced gap marker ahead of the surviving items,
//!   so the client knows measurements went missing and how many.
//! - **hard**: a queue that stays above its high-water mark for longer than
//!   the grace period flips to evicted; the writer sees it on its next wait
//!   and disconnects the session.
//!
//! The queue lock is a plain mutex held only for pointer-sized bookkeeping,
//! never across I/O.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Items a queue can synthesize a gap marker for.
pub trait GapMarker: Sized {
    /// Builds the marker standing in for `dropped` discarded items.
    fn gap(dropped: u64) -> Self;
}

/// Result of offering an item to a session's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued without loss.
    Delivered,
    /// Enqueued, but the oldest buffered item was discarded to make room.
    DroppedOldest,
    /// The queue has now been above its high-water mark past the grace
    /// period; the session must be evicted.
    EvictionTriggered {
        /// How long the queue has been above the mark.
        sustained: Duration,
    },
    /// The queue was already closed or evicted; the item was discarded.
    Closed,
}

/// What a drain call produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Drained<T> {
    /// Items to deliver, gap marker (if any) first.
    Items(Vec<T>),
    /// The hard backpressure ceiling fired; buffered items are discarded.
    Evicted {
        /// How long the queue sat above the high-water mark.
        sustained: Duration,
    },
    /// The queue was closed by session teardown.
    Closed,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    /// Drops since the last emitted gap marker.
    pending_gap: u64,
    dropped_total: u64,
    /// When occupancy first exceeded the high-water mark, if it still does.
    over_since: Option<Instant>,
    evicted: Option<Duration>,
    closed: bool,
}

/// Bounded single-producer single-consumer queue with the backpressure
/// policy above.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    high_water: usize,
    grace: Duration,
}

impl<T: GapMarker> OutboundQueue<T> {
    /// Creates a queue holding at most `capacity` items, with the eviction
    /// clock armed above `high_water` and firing after `grace`.
    pub fn new(capacity: usize, high_water: usize, grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                pending_gap: 0,
                dropped_total: 0,
                over_since: None,
                evicted: None,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            high_water,
            grace,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Offers an item. Never blocks and never awaits.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed || inner.evicted.is_some() {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Delivered;
            if inner.items.len() == self.capacity {
                inner.items.pop_front();
                inner.pending_gap += 1;
                inner.dropped_total += 1;
                outcome = PushOutcome::DroppedOldest;
            }
            inner.items.push_back(item);

            if inner.items.len() > self.high_water {
                let since = *inner.over_since.get_or_insert_with(Instant::now);
                let sustained = since.elapsed();
                if sustained >= self.grace {
                    inner.evicted = Some(sustained);
                    outcome = PushOutcome::EvictionTriggered { sustained };
                }
            } else {
                inner.over_since = None;
            }
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits until there is something to deliver, the queue is evicted, or
    /// it is closed. Items come out oldest first, preceded by a gap marker
    /// when drops occurred since the previous drain.
    pub async fn drain(&self) -> Drained<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(sustained) = inner.evicted {
                    inner.items.clear();
                    return Drained::Evicted { sustained };
                }
                if !inner.items.is_empty() || inner.pending_gap > 0 {
                    let mut batch = Vec::with_capacity(inner.items.len() + 1);
                    if inner.pending_gap > 0 {
                        batch.push(T::gap(inner.pending_gap));
                        inner.pending_gap = 0;
                    }
                    batch.extend(inner.items.drain(..));
                    inner.over_since = None;
                    return Drained::Items(batch);
                }
                if inner.closed {
                    return Drained::Closed;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks the queue closed; the waiting drain returns [`Drained::Closed`]
    /// and later pushes are discarded.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded by the drop-oldest policy over the queue's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.lock().dropped_total
    }

    /// True once the hard backpressure ceiling has fired.
    pub fn is_evicted(&self) -> bool {
        self.lock().evicted.is_some()
    }
}
