//! Deserializable shape of the configuration surface described in §6.
//!
//! Merging defaults with files and environment overrides is an external
//! collaborator's job (`spec.md` §1); this module only owns the `serde`
//! shape and the pure helper that turns it into the exporter's channel
//! schema (`collect_known_channels_from_config`, §4.7).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub check_dependencies: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_window_s")]
    pub window_s: f64,
}

fn default_window_s() -> f64 {
    30.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_s: default_window_s(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Ordered key -> label mapping; the first entry is the default sticky label.
    #[serde(default)]
    pub event_keymap: Vec<(String, String)>,
    #[serde(default)]
    pub enable_triggers: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SpikesConfig {
    #[serde(default)]
    pub spike_keymap: Vec<(String, String)>,
    #[serde(default)]
    pub enable_triggers: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportOutConfig {
    #[serde(default = "default_synced_dir")]
    pub synced_dir: String,
    #[serde(default = "default_markers_dir")]
    pub markers_dir: String,
}

fn default_synced_dir() -> String {
    "data/synced".into()
}
fn default_markers_dir() -> String {
    "data/markers".into()
}

impl Default for ExportOutConfig {
    fn default() -> Self {
        Self {
            synced_dir: default_synced_dir(),
            markers_dir: default_markers_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_true")]
    pub export_enable: bool,
    #[serde(default = "default_true")]
    pub csv_signal_enable: bool,
    #[serde(default = "default_true")]
    pub csv_marker_enable: bool,
    #[serde(default = "default_lookahead_sec")]
    pub lookahead_sec: f64,
    #[serde(default = "default_flush_period_sec")]
    pub flush_period_sec: f64,
    #[serde(default)]
    pub flush_rows: i64,
    #[serde(default = "default_idle_watermark_sec")]
    pub idle_watermark_sec: f64,
    #[serde(default)]
    pub print_k: bool,
    #[serde(default)]
    pub out: ExportOutConfig,
}

fn default_true() -> bool {
    true
}
fn default_lookahead_sec() -> f64 {
    0.1
}
fn default_flush_period_sec() -> f64 {
    1.0
}
fn default_idle_watermark_sec() -> f64 {
    2.0
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            export_enable: true,
            csv_signal_enable: true,
            csv_marker_enable: true,
            lookahead_sec: default_lookahead_sec(),
            flush_period_sec: default_flush_period_sec(),
            flush_rows: 0,
            idle_watermark_sec: default_idle_watermark_sec(),
            print_k: false,
            out: ExportOutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UiConfig {
    #[serde(default)]
    pub plot_decimate_hz: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub enabled: bool,
    pub device_name: String,
    pub fs: f64,
    #[serde(default)]
    pub plot_enable: bool,
    #[serde(default = "default_true")]
    pub export_enable: bool,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub spikes: SpikesConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AcquisitionConfig {
    pub fn from_json_str(text: &str) -> CoreResult<Self> {
        serde_json::from_str(text).map_err(|e| CoreError::Config(e.to_string()))
    }
}

/// Ordered, deduplicated `device:channel` schema for enabled+export-enabled
/// devices, in config insertion order (§4.7).
pub fn collect_known_channels_from_config(cfg: &AcquisitionConfig) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for device in &cfg.devices {
        if !device.enabled || !device.export_enable {
            continue;
        }
        for channel in &device.channels {
            let key = format!("{}:{}", device.device_name, channel);
            if seen.insert(key.clone()) {
                out.push(key);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "events": {"event_keymap": [["0", "REST"], ["1", "TASK"]]},
            "devices": [
                {"enabled": true, "device_name": "eeg", "fs": 250.0, "export_enable": true,
                 "channels": ["ch1", "ch2"]}
            ]
        }"#;
        let cfg = AcquisitionConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.events.event_keymap[0].1, "REST");
        let schema = collect_known_channels_from_config(&cfg);
        assert_eq!(schema, vec!["eeg:ch1".to_string(), "eeg:ch2".to_string()]);
    }

    #[test]
    fn disabled_devices_are_excluded() {
        let json = r#"{
            "devices": [
                {"enabled": false, "device_name": "gsr", "fs": 10.0, "channels": ["gsr_uS"]}
            ]
        }"#;
        let cfg = AcquisitionConfig::from_json_str(json).unwrap();
        assert!(collect_known_channels_from_config(&cfg).is_empty());
    }
}
