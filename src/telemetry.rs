//! Rolling-window counters and drop-count bookkeeping surfaced to logging.
//!
//! `telemetry.WINDOW_S` in the configuration surface (§6) governs external
//! handler counters (raw-ADC-to-physical-unit conversion, out of scope here);
//! the same rolling window is reused internally for periodic ingestion-drop
//! summaries (§7: "Queue overflow (ingestion): ... periodic log summary").

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counts events within a trailing time window, evicting anything older.
pub struct RollingWindowCounter {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RollingWindowCounter {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window: Duration::from_secs_f64(window_secs.max(0.0)),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&self, when: Instant) {
        let mut events = self.events.lock();
        events.push_back(when);
        self.evict_locked(&mut events, when);
    }

    /// Events per second averaged over the trailing window.
    pub fn rate_per_sec(&self) -> f64 {
        let now = Instant::now();
        let mut events = self.events.lock();
        self.evict_locked(&mut events, now);
        if self.window.as_secs_f64() <= 0.0 {
            return 0.0;
        }
        events.len() as f64 / self.window.as_secs_f64()
    }

    pub fn count(&self) -> usize {
        let now = Instant::now();
        let mut events = self.events.lock();
        self.evict_locked(&mut events, now);
        events.len()
    }

    fn evict_locked(&self, events: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window() {
        let c = RollingWindowCounter::new(60.0);
        for _ in 0..5 {
            c.record();
        }
        assert_eq!(c.count(), 5);
    }
}
