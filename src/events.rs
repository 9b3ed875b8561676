//! Sticky event bus (component B, §4.3): a labeled state that persists
//! across rows until toggled or replaced.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::warn;
use parking_lot::Mutex;

use crate::bus::{SubscriberId, Subscribers};

/// Either a live timestamp (produced by [`EventBus::set_event`]) or a
/// previously-quantized one being replayed through
/// [`EventBus::announce_change_at`].
#[derive(Debug, Clone, Copy)]
pub enum NotificationTime {
    Monotonic(Instant),
    Quantized { t_q: f64, k: i64 },
}

#[derive(Debug, Clone)]
pub struct EventNotification {
    pub ts: NotificationTime,
    pub label: String,
    pub prev_label: String,
    pub source: String,
}

pub struct EventBus {
    keymap: Vec<(String, String)>,
    default_label: String,
    current: Mutex<String>,
    enabled: AtomicBool,
    warned_missing_keys: Mutex<HashSet<String>>,
    subscribers: Subscribers<EventNotification>,
}

impl EventBus {
    /// `keymap` is an ordered key -> label mapping; its first entry supplies
    /// the initial (and toggle-back) sticky label.
    pub fn new(keymap: Vec<(String, String)>, enabled: bool) -> Self {
        let default_label = keymap
            .first()
            .map(|(_, label)| label.clone())
            .unwrap_or_default();
        Self {
            keymap,
            current: Mutex::new(default_label.clone()),
            default_label,
            enabled: AtomicBool::new(enabled),
            warned_missing_keys: Mutex::new(HashSet::new()),
            subscribers: Subscribers::new(),
        }
    }

    pub fn current_label(&self) -> String {
        self.current.lock().clone()
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Resets sticky state to the default label without broadcasting;
    /// called at the start of a new session (§4.1 `start_session`).
    pub fn reset_to_default(&self) {
        *self.current.lock() = self.default_label.clone();
    }

    /// Toggle-back semantics (§4.3): setting the already-current label
    /// reverts to the default label; anything else replaces it outright.
    pub fn set_event(&self, label: &str, source: &str) -> Option<(String, String)> {
        if !self.enabled.load(Ordering::Relaxed) {
            warn!("event bus disabled; ignoring set_event({label}, {source})");
            return None;
        }

        let (new_label, prev_label) = {
            let mut current = self.current.lock();
            let prev = current.clone();
            let new = if label == prev.as_str() {
                self.default_label.clone()
            } else {
                label.to_string()
            };
            *current = new.clone();
            (new, prev)
        };

        self.subscribers.broadcast(&EventNotification {
            ts: NotificationTime::Monotonic(Instant::now()),
            label: new_label.clone(),
            prev_label: prev_label.clone(),
            source: source.to_string(),
        });

        Some((new_label, prev_label))
    }

    /// Resolves `key` through the configured keymap before calling
    /// [`set_event`](Self::set_event). Unknown keys are logged once and
    /// ignored, matching the "unmapped key" rule in §4.3.
    pub fn set_event_by_key(&self, key: &str, source: &str) -> Option<(String, String)> {
        match self.keymap.iter().find(|(k, _)| k == key) {
            Some((_, label)) => self.set_event(label, source),
            None => {
                let mut warned = self.warned_missing_keys.lock();
                if warned.insert(key.to_string()) {
                    warn!("event bus: unmapped key '{key}', ignoring");
                }
                None
            }
        }
    }

    /// Pure broadcast at an externally supplied quantized time; does not
    /// touch sticky state. Used by the synchronizer to replay an
    /// already-resolved event through the consumer loop.
    pub fn announce_change_at(&self, t_q: f64, k: i64, label: &str, prev: &str, source: &str) {
        self.subscribers.broadcast(&EventNotification {
            ts: NotificationTime::Quantized { t_q, k },
            label: label.to_string(),
            prev_label: prev.to_string(),
            source: source.to_string(),
        });
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&EventNotification) + Send>) -> SubscriberId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keymap() -> Vec<(String, String)> {
        vec![("0".into(), "REST".into()), ("1".into(), "TASK".into())]
    }

    #[test]
    fn toggle_semantics_s4() {
        let bus = EventBus::new(keymap(), true);
        assert_eq!(bus.current_label(), "REST");

        let (new, _) = bus.set_event("TASK", "keyboard").unwrap();
        assert_eq!(new, "TASK");
        assert_eq!(bus.current_label(), "TASK");

        let (new, _) = bus.set_event("TASK", "keyboard").unwrap();
        assert_eq!(new, "REST");

        let (new, _) = bus.set_event("OTHER", "keyboard").unwrap();
        assert_eq!(new, "OTHER");
        assert_eq!(bus.current_label(), "OTHER");
    }

    #[test]
    fn disabled_bus_does_not_mutate() {
        let bus = EventBus::new(keymap(), false);
        assert!(bus.set_event("TASK", "x").is_none());
        assert_eq!(bus.current_label(), "REST");
    }

    #[test]
    fn unmapped_key_logs_once_and_ignores() {
        let bus = EventBus::new(keymap(), true);
        assert!(bus.set_event_by_key("9", "x").is_none());
        assert_eq!(bus.current_label(), "REST");
    }

    #[test]
    fn subscriber_panic_does_not_propagate() {
        let bus = EventBus::new(keymap(), true);
        bus.subscribe(Box::new(|_| panic!("boom")));
        let result = bus.set_event("TASK", "x");
        assert!(result.is_some());
    }
}
