//! Bounded FIFO queue shared by the ingestion path and every sink.
//!
//! Two non-blocking write modes share one structure:
//! - [`DropOldestQueue::push_drop_oldest`] — the ingestion policy (§4.2):
//!   on a full bounded queue the oldest element is evicted to admit the new
//!   one.
//! - [`DropOldestQueue::try_offer`] — the sink policy (§4.1/§4.6): a full
//!   queue simply refuses the new element; the caller counts the drop.
//!
//! Capacity `<= 0` means unbounded (never drops). Built on
//! `crossbeam_queue::{ArrayQueue, SegQueue}`, the same lock-free queues the
//! teacher's `SyncManager` LockFree mode uses for its diagnostic log;
//! `ArrayQueue::force_push` already *is* drop-oldest-on-full. Reads are
//! blocking-with-timeout via a short poll loop, the same
//! `CONSUMER_POLL_MS`-style sleep the teacher's consumer thread uses instead
//! of a condvar wakeup; [`DropOldestQueue::close`] flips an atomic flag so
//! no blocked reader waits longer than one poll tick past shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::{ArrayQueue, SegQueue};

/// Interval between re-polls while blocked in `pop_timeout`, mirroring the
/// teacher's `CONSUMER_POLL_MS` consumer sleep.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Outcome of a timed, blocking dequeue.
pub enum Pop<T> {
    /// An item was available.
    Item(T),
    /// No item arrived before the timeout; the caller should re-poll.
    Timeout,
    /// The queue is closed and drained; no further items will ever arrive.
    Closed,
}

enum Storage<T> {
    Bounded(ArrayQueue<T>),
    Unbounded(SegQueue<T>),
}

impl<T> Storage<T> {
    fn pop(&self) -> Option<T> {
        match self {
            Storage::Bounded(q) => q.pop(),
            Storage::Unbounded(q) => q.pop(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Bounded(q) => q.len(),
            Storage::Unbounded(q) => q.len(),
        }
    }
}

pub struct DropOldestQueue<T> {
    storage: Storage<T>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    /// `capacity <= 0` means unbounded.
    pub fn new(capacity: i64) -> Self {
        let storage = if capacity <= 0 {
            Storage::Unbounded(SegQueue::new())
        } else {
            Storage::Bounded(ArrayQueue::new(capacity as usize))
        };
        Self {
            storage,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Ingestion-path write: never blocks, evicts the oldest item on overflow.
    pub fn push_drop_oldest(&self, item: T) {
        match &self.storage {
            Storage::Bounded(q) => {
                if q.force_push(item).is_some() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Storage::Unbounded(q) => q.push(item),
        }
    }

    /// Sink-path write: never blocks, drops the new item on overflow.
    /// Returns `true` if the item was accepted.
    pub fn try_offer(&self, item: T) -> bool {
        match &self.storage {
            Storage::Bounded(q) => match q.push(item) {
                Ok(()) => true,
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            Storage::Unbounded(q) => {
                q.push(item);
                true
            }
        }
    }

    /// Blocking dequeue with a timeout. Drains whatever remains even after
    /// [`close`](Self::close) before reporting [`Pop::Closed`].
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.storage.pop() {
                return Pop::Item(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return Pop::Closed;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Pop::Timeout;
            }
            thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    /// Marks the queue closed; remaining items are still delivered by
    /// subsequent `pop_timeout` calls (used by sinks, which must receive
    /// everything handed to them before shutdown).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Marks the queue closed, discarding whatever is currently queued (used
    /// by the ingestion queue: the consumer must stop the instant the stop
    /// flag is observed, not after draining).
    pub fn close_discard(&self) {
        while self.storage.pop().is_some() {}
        self.closed.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_evicts_front() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(2);
        q.push_drop_oldest(1);
        q.push_drop_oldest(2);
        q.push_drop_oldest(3);
        assert_eq!(q.dropped_count(), 1);
        match q.pop_timeout(Duration::from_millis(10)) {
            Pop::Item(v) => assert_eq!(v, 2),
            _ => panic!("expected item"),
        }
        match q.pop_timeout(Duration::from_millis(10)) {
            Pop::Item(v) => assert_eq!(v, 3),
            _ => panic!("expected item"),
        }
    }

    #[test]
    fn unbounded_never_drops() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(0);
        for i in 0..10_000 {
            q.push_drop_oldest(i);
        }
        assert_eq!(q.dropped_count(), 0);
        assert_eq!(q.len(), 10_000);
    }

    #[test]
    fn try_offer_drops_new_item_on_full() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(1);
        assert!(q.try_offer(1));
        assert!(!q.try_offer(2));
        assert_eq!(q.dropped_count(), 1);
        match q.pop_timeout(Duration::from_millis(10)) {
            Pop::Item(v) => assert_eq!(v, 1),
            _ => panic!("expected item"),
        }
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let q: std::sync::Arc<DropOldestQueue<i32>> = std::sync::Arc::new(DropOldestQueue::new(4));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || match q2.pop_timeout(Duration::from_secs(5)) {
            Pop::Closed => true,
            _ => false,
        });
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn close_discard_drops_queued_items() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(0);
        q.push_drop_oldest(1);
        q.push_drop_oldest(2);
        q.close_discard();
        match q.pop_timeout(Duration::from_millis(10)) {
            Pop::Closed => {}
            _ => panic!("expected closed"),
        }
    }
}
