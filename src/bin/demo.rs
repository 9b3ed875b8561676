//! Demo binary: wires synthetic producers, a marker injector, the
//! synchronizer, and the CSV exporter together for a short fixed-duration
//! run, the same role `main.rs` plays for the teacher's sensor pipeline.

use std::time::Duration;

use sigsync_core::config::AcquisitionConfig;
use sigsync_core::contracts::{
    spawn_demo_producer, spawn_marker_injector, wait_for_producers, DeviceInventory, StopFlag,
};
use sigsync_core::export::{Exporter, ExporterOptions};
use sigsync_core::sync::{SyncConfig, Synchronizer};

const DEMO_CONFIG: &str = r#"{
    "events": {"event_keymap": [["0", "REST"], ["1", "TASK"]], "enable_triggers": true},
    "spikes": {"spike_keymap": [["s", "STIM"]], "enable_triggers": true},
    "export": {
        "export_enable": true,
        "csv_signal_enable": true,
        "csv_marker_enable": true,
        "lookahead_sec": 0.1,
        "flush_period_sec": 1.0,
        "idle_watermark_sec": 2.0,
        "out": {"synced_dir": "data/synced", "markers_dir": "data/markers"}
    },
    "devices": [
        {"enabled": true, "device_name": "eeg", "fs": 250.0, "export_enable": true, "channels": ["ch1", "ch2"]},
        {"enabled": true, "device_name": "gsr", "fs": 10.0, "export_enable": true, "channels": ["gsr_uS"]}
    ]
}"#;

fn main() {
    env_logger::init();

    let cfg = AcquisitionConfig::from_json_str(DEMO_CONFIG).expect("demo config is valid");
    let inventory = DeviceInventory::from_config(&cfg);
    let fs_max = inventory.fs_max();
    let delta = 1.0 / fs_max;

    let default_event_label = cfg
        .events
        .event_keymap
        .first()
        .map(|(_, label)| label.clone())
        .unwrap_or_default();

    let sync = Synchronizer::new(SyncConfig {
        queue_capacity: 4096,
        plot_decimate_hz: cfg.ui.plot_decimate_hz,
        event_keymap: cfg.events.event_keymap.clone(),
        events_enabled: cfg.events.enable_triggers,
        spike_keymap: cfg.spikes.spike_keymap.clone(),
        spikes_enabled: cfg.spikes.enable_triggers,
        telemetry_window_s: cfg.telemetry.window_s,
    });

    let exporter = Exporter::new(ExporterOptions {
        session_id: "demo".into(),
        schema: inventory.schema.clone(),
        fs_max,
        lookahead_sec: cfg.export.lookahead_sec,
        flush_period_sec: cfg.export.flush_period_sec,
        flush_rows: cfg.export.flush_rows,
        idle_watermark_sec: cfg.export.idle_watermark_sec,
        include_k_column: cfg.export.print_k,
        enable_signal_csv: cfg.export.csv_signal_enable,
        enable_marker_csv: cfg.export.csv_marker_enable,
        signal_dir: cfg.export.out.synced_dir.clone().into(),
        marker_dir: cfg.export.out.markers_dir.clone().into(),
        default_event_label,
        sink_queue_capacity: 4096,
    });

    sync.add_sink_queue(exporter.queue())
        .expect("register exporter sink before session start");

    exporter.start().expect("exporter start");
    sync.start_session(delta).expect("synchronizer start_session");

    let stop = StopFlag::new();
    let mut handles = Vec::new();
    for device in &inventory.devices {
        handles.push(spawn_demo_producer(
            device.device_name.clone(),
            device.fs,
            device.channels.clone(),
            stop.clone(),
            sync.clone(),
        ));
    }
    handles.push(spawn_marker_injector(
        "TASK".into(),
        "demo".into(),
        Duration::from_secs(2),
        stop.clone(),
        sync.clone(),
    ));

    log::info!("sigsync-demo running for 5s against fs_max={fs_max}Hz (delta={delta})");
    std::thread::sleep(Duration::from_secs(5));

    stop.request_stop();
    wait_for_producers(handles);

    sync.stop_session();
    exporter.stop();

    log::info!("sigsync-demo finished; see data/synced and data/markers");
}
