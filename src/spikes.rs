//! Stateless spike bus (component C, §4.4): one-shot pulses with no sticky
//! state, unlike [`crate::events::EventBus`]. Every trigger is broadcast and
//! forgotten.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::warn;
use parking_lot::Mutex;

use crate::bus::{SubscriberId, Subscribers};

#[derive(Debug, Clone, Copy)]
pub enum NotificationTime {
    Monotonic(Instant),
    Quantized { t_q: f64, k: i64 },
}

#[derive(Debug, Clone)]
pub struct SpikeNotification {
    pub ts: NotificationTime,
    pub label: String,
    pub source: String,
}

pub struct SpikeBus {
    keymap: Vec<(String, String)>,
    enabled: AtomicBool,
    warned_missing_keys: Mutex<HashSet<String>>,
    subscribers: Subscribers<SpikeNotification>,
}

impl SpikeBus {
    pub fn new(keymap: Vec<(String, String)>, enabled: bool) -> Self {
        Self {
            keymap,
            enabled: AtomicBool::new(enabled),
            warned_missing_keys: Mutex::new(HashSet::new()),
            subscribers: Subscribers::new(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Fires a one-shot pulse under `label`. Unlike the event bus there is no
    /// stored state to toggle: every call broadcasts, no matter the label.
    pub fn trigger_spike(&self, label: &str, source: &str) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            warn!("spike bus disabled; ignoring trigger_spike({label}, {source})");
            return false;
        }

        self.subscribers.broadcast(&SpikeNotification {
            ts: NotificationTime::Monotonic(Instant::now()),
            label: label.to_string(),
            source: source.to_string(),
        });
        true
    }

    pub fn trigger_spike_by_key(&self, key: &str, source: &str) -> bool {
        match self.keymap.iter().find(|(k, _)| k == key) {
            Some((_, label)) => self.trigger_spike(label, source),
            None => {
                let mut warned = self.warned_missing_keys.lock();
                if warned.insert(key.to_string()) {
                    warn!("spike bus: unmapped key '{key}', ignoring");
                }
                false
            }
        }
    }

    /// Pure replay broadcast at an already-resolved quantized time. Used by
    /// the synchronizer when a spike lands squarely on a grid point that has
    /// not yet been committed to a sink.
    pub fn announce_spike_at(&self, t_q: f64, k: i64, label: &str, source: &str) {
        self.subscribers.broadcast(&SpikeNotification {
            ts: NotificationTime::Quantized { t_q, k },
            label: label.to_string(),
            source: source.to_string(),
        });
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&SpikeNotification) + Send>) -> SubscriberId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_trigger_broadcasts_no_toggle() {
        let bus = SpikeBus::new(vec![("s".into(), "STIM".into())], true);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        bus.subscribe(Box::new(move |n| seen_cb.lock().push(n.label.clone())));

        assert!(bus.trigger_spike("STIM", "marker"));
        assert!(bus.trigger_spike("STIM", "marker"));
        assert!(bus.trigger_spike("STIM", "marker"));

        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn disabled_bus_does_not_broadcast() {
        let bus = SpikeBus::new(Vec::new(), false);
        let seen = std::sync::Arc::new(Mutex::new(0usize));
        let seen_cb = seen.clone();
        bus.subscribe(Box::new(move |_| *seen_cb.lock() += 1));
        assert!(!bus.trigger_spike("STIM", "marker"));
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn unmapped_key_logs_once_and_ignores() {
        let bus = SpikeBus::new(vec![("s".into(), "STIM".into())], true);
        assert!(!bus.trigger_spike_by_key("missing", "marker"));
    }

    #[test]
    fn subscriber_panic_does_not_propagate() {
        let bus = SpikeBus::new(Vec::new(), true);
        bus.subscribe(Box::new(|_| panic!("boom")));
        assert!(bus.trigger_spike("STIM", "marker"));
    }
}
