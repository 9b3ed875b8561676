//! Shared subscriber-registry machinery for the event and spike buses.
//!
//! Both buses broadcast to a dynamic set of opaque callbacks (§9 "Dynamic
//! callback subscriber lists"). A callback failure is caught and logged,
//! never propagated (§4.3/§4.4/§7).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub struct Subscribers<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriberId, Box<dyn Fn(&T) + Send>)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&T) + Send>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.callbacks.lock().retain(|(existing, _)| *existing != id);
    }

    /// Calls every subscriber, catching and logging panics so one broken
    /// callback never stops the rest or propagates into the caller.
    pub fn broadcast(&self, event: &T) {
        let callbacks = self.callbacks.lock();
        for (id, callback) in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("subscriber {:?} panicked handling a bus notification", id);
            }
        }
    }
}
