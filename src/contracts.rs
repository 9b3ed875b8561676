//! Producer-side contracts and helpers (component G, §6 + SPEC_FULL §F).
//!
//! None of this module carries its own correctness invariants: it exists so
//! producers, the demo binary, and integration-style tests have a uniform
//! way to start, stop, and drive a [`crate::sync::Synchronizer`], the same
//! role the teacher's `main.rs` plays for its sensors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use crate::config::{AcquisitionConfig, DeviceConfig};
use crate::sync::Synchronizer;

/// Cloneable stop signal polled between loop iterations by every thread in
/// the system, mirroring the teacher's `running: Arc<AtomicBool>` pattern.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins every producer handle, swallowing panics the way `main.rs` does
/// for its sensor threads — a producer's own failure must not prevent a
/// clean shutdown of the rest.
pub fn wait_for_producers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.join();
    }
}

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub device_name: String,
    pub fs: f64,
    pub channels: Vec<String>,
    pub plot_enable: bool,
    pub export_enable: bool,
}

/// Filesystem/channel bookkeeping derived from configuration: which devices
/// are active, what their sample rates are, and the exporter's channel
/// schema built from them.
pub struct DeviceInventory {
    pub devices: Vec<DeviceEntry>,
    pub schema: Vec<String>,
}

impl DeviceInventory {
    pub fn from_config(cfg: &AcquisitionConfig) -> Self {
        let devices: Vec<DeviceEntry> = cfg
            .devices
            .iter()
            .filter(|d: &&DeviceConfig| d.enabled)
            .map(|d| DeviceEntry {
                device_name: d.device_name.clone(),
                fs: d.fs,
                channels: d.channels.clone(),
                plot_enable: d.plot_enable,
                export_enable: d.export_enable,
            })
            .collect();
        let schema = crate::config::collect_known_channels_from_config(cfg);
        Self { devices, schema }
    }

    /// Highest sample rate among enabled devices; the grid spacing `delta`
    /// is derived from this (§3).
    pub fn fs_max(&self) -> f64 {
        self.devices
            .iter()
            .map(|d| d.fs)
            .fold(0.0_f64, f64::max)
    }
}

/// Demo-only synthetic producer: ticks at `1/fs` using `spin_sleep`, the
/// same periodic-release technique the teacher's `Sensor::run` uses, and
/// feeds a deterministic-looking sine wave plus noise into the
/// synchronizer. Exists only to drive the bin target and tests; it carries
/// no invariants of the core itself.
pub fn spawn_demo_producer(
    device_name: String,
    fs: f64,
    channels: Vec<String>,
    stop: StopFlag,
    sync: Arc<Synchronizer>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let period = Duration::from_secs_f64(1.0 / fs.max(1.0));
        let mut rng = rand::rng();
        let mut t = 0.0_f64;
        let mut next_release = std::time::Instant::now();

        while !stop.should_stop() {
            let values: Vec<(String, f64)> = channels
                .iter()
                .enumerate()
                .map(|(i, ch)| {
                    let phase = t * (1.0 + i as f64 * 0.1);
                    let noise: f64 = rng.random_range(-0.01..0.01);
                    (ch.clone(), phase.sin() + noise)
                })
                .collect();

            sync.enqueue_packet(t, device_name.clone(), values);

            t += 1.0 / fs.max(1.0);
            next_release += period;
            spin_sleep::sleep(next_release.saturating_duration_since(std::time::Instant::now()));
        }
    })
}

/// Demo-only marker injector: periodically calls `set_event` on a fixed
/// schedule, grounded on the teacher's independent feedback-handler thread
/// pattern (`spawn_feedback_handler`).
pub fn spawn_marker_injector(
    label: String,
    source: String,
    period: Duration,
    stop: StopFlag,
    sync: Arc<Synchronizer>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.should_stop() {
            spin_sleep::sleep(period);
            if stop.should_stop() {
                break;
            }
            sync.set_event(&label, &source);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_is_observed_across_clones() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!clone.should_stop());
        flag.request_stop();
        assert!(clone.should_stop());
    }

    #[test]
    fn inventory_computes_fs_max_and_schema() {
        let json = r#"{
            "devices": [
                {"enabled": true, "device_name": "eeg", "fs": 250.0, "export_enable": true, "channels": ["c1"]},
                {"enabled": true, "device_name": "gsr", "fs": 10.0, "export_enable": true, "channels": ["g1"]},
                {"enabled": false, "device_name": "off", "fs": 1000.0, "channels": ["x"]}
            ]
        }"#;
        let cfg = AcquisitionConfig::from_json_str(json).unwrap();
        let inv = DeviceInventory::from_config(&cfg);
        assert_eq!(inv.devices.len(), 2);
        assert_eq!(inv.fs_max(), 250.0);
        assert_eq!(inv.schema, vec!["eeg:c1".to_string(), "gsr:g1".to_string()]);
    }
}
