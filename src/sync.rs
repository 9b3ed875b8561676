//! Synchronizer: bounded-queue ingestion, per-device anchoring, grid
//! quantization, and sink fan-out with plot decimation (components D and F,
//! §4.1/§4.2/§4.6).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{error, warn};
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::queue::{DropOldestQueue, Pop};
use crate::spikes::SpikeBus;
use crate::telemetry::RollingWindowCounter;

/// Quantized payload handed to every registered sink (§3).
#[derive(Debug, Clone)]
pub enum Payload {
    Sample {
        t_q: f64,
        k: i64,
        device: String,
        channels: Vec<(String, f64)>,
    },
    Event {
        t_q: f64,
        k: i64,
        label: String,
        prev_label: String,
        source: String,
    },
    Spike {
        t_q: f64,
        k: i64,
        label: String,
        source: String,
    },
}

struct SamplePacket {
    device_ts: f64,
    device_name: String,
    channels: Vec<(String, f64)>,
}

enum IngestItem {
    Sample(SamplePacket),
    Event {
        t_q: f64,
        k: i64,
        label: String,
        prev_label: String,
        source: String,
    },
    Spike {
        t_q: f64,
        k: i64,
        label: String,
        source: String,
    },
}

struct DeviceAnchor {
    first_device_ts: f64,
    host_ts_at_first: f64,
    epoch: u64,
    last_device_ts: f64,
}

struct SessionState {
    delta: f64,
    decimals: usize,
    host_epoch: Instant,
}

pub struct SyncConfig {
    /// `<= 0` means unbounded (§4.2).
    pub queue_capacity: i64,
    /// `<= 0` disables plot decimation (§4.6).
    pub plot_decimate_hz: f64,
    pub event_keymap: Vec<(String, String)>,
    pub events_enabled: bool,
    pub spike_keymap: Vec<(String, String)>,
    pub spikes_enabled: bool,
    pub telemetry_window_s: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 0,
            plot_decimate_hz: 0.0,
            event_keymap: Vec::new(),
            events_enabled: true,
            spike_keymap: Vec::new(),
            spikes_enabled: true,
            telemetry_window_s: 30.0,
        }
    }
}

pub struct Synchronizer {
    cfg: SyncConfig,
    session: Mutex<Option<SessionState>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    ingestion: DropOldestQueue<IngestItem>,
    anchors: DashMap<String, DeviceAnchor>,
    event_bus: EventBus,
    spike_bus: SpikeBus,
    sinks: Mutex<Vec<Arc<DropOldestQueue<Payload>>>>,
    plot_sinks: Mutex<Vec<Arc<DropOldestQueue<Payload>>>>,
    sink_drops: DashMap<usize, AtomicU64>,
    last_emitted_k: DashMap<String, i64>,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
    ingestion_drops: RollingWindowCounter,
    last_drop_log: Mutex<(Instant, u64)>,
    self_weak: Weak<Synchronizer>,
}

pub(crate) fn compute_decimals(delta: f64) -> usize {
    (((-delta.log10()).ceil() as i64) + 1).max(0) as usize
}

fn floor_to_decimals(x: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (x * factor).floor() / factor
}

fn quantize(host_ts: f64, delta: f64, decimals: usize) -> (f64, i64) {
    let k = (host_ts / delta).round() as i64;
    let t_q = floor_to_decimals(k as f64 * delta, decimals);
    (t_q, k)
}

impl Synchronizer {
    pub fn new(cfg: SyncConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let event_bus = EventBus::new(cfg.event_keymap.clone(), cfg.events_enabled);
            let spike_bus = SpikeBus::new(cfg.spike_keymap.clone(), cfg.spikes_enabled);
            let ingestion = DropOldestQueue::new(cfg.queue_capacity);
            let telemetry_window_s = cfg.telemetry_window_s;
            Self {
                cfg,
                session: Mutex::new(None),
                started: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                ingestion,
                anchors: DashMap::new(),
                event_bus,
                spike_bus,
                sinks: Mutex::new(Vec::new()),
                plot_sinks: Mutex::new(Vec::new()),
                sink_drops: DashMap::new(),
                last_emitted_k: DashMap::new(),
                consumer_handle: Mutex::new(None),
                ingestion_drops: RollingWindowCounter::new(telemetry_window_s),
                last_drop_log: Mutex::new((Instant::now(), 0)),
                self_weak: weak.clone(),
            }
        })
    }

    /// Initializes session state and starts the single consumer thread.
    /// Fails with `AlreadyStarted` if a session is already running.
    pub fn start_session(&self, delta: f64) -> CoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyStarted);
        }

        let decimals = compute_decimals(delta);
        *self.session.lock() = Some(SessionState {
            delta,
            decimals,
            host_epoch: Instant::now(),
        });
        self.anchors.clear();
        self.last_emitted_k.clear();
        self.event_bus.reset_to_default();
        self.stop_requested.store(false, Ordering::SeqCst);

        let worker = self
            .self_weak
            .upgrade()
            .expect("synchronizer dropped while starting session");
        let handle = std::thread::spawn(move || worker.run_consumer());
        *self.consumer_handle.lock() = Some(handle);
        Ok(())
    }

    /// Safe to call even if `start_session` was never called or already
    /// returned an error; a double call is a no-op.
    pub fn stop_session(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.ingestion.close_discard();
        if let Some(handle) = self.consumer_handle.lock().take() {
            let _ = handle.join();
        }
        self.sinks.lock().clear();
        self.plot_sinks.lock().clear();
        *self.session.lock() = None;
    }

    /// Non-blocking; drops the oldest queued packet on overflow (§4.2).
    pub fn enqueue_packet(&self, device_ts: f64, device_name: String, channels: Vec<(String, f64)>) {
        let before = self.ingestion.dropped_count();
        self.ingestion.push_drop_oldest(IngestItem::Sample(SamplePacket {
            device_ts,
            device_name,
            channels,
        }));
        if self.ingestion.dropped_count() > before {
            self.ingestion_drops.record();
        }
    }

    /// Quantizes at call time, forwards to the sticky event bus, and
    /// enqueues the resolved payload in-band so ordering with samples at the
    /// same `k` is preserved through the consumer loop.
    pub fn set_event(&self, label: &str, source: &str) -> Option<(String, String)> {
        let (t_q, k) = self.current_quantized_now()?;
        let (new_label, prev_label) = self.event_bus.set_event(label, source)?;
        self.ingestion.push_drop_oldest(IngestItem::Event {
            t_q,
            k,
            label: new_label.clone(),
            prev_label: prev_label.clone(),
            source: source.to_string(),
        });
        Some((new_label, prev_label))
    }

    pub fn trigger_spike(&self, label: &str, source: &str) -> bool {
        let (t_q, k) = match self.current_quantized_now() {
            Some(tk) => tk,
            None => return false,
        };
        if !self.spike_bus.trigger_spike(label, source) {
            return false;
        }
        self.ingestion.push_drop_oldest(IngestItem::Spike {
            t_q,
            k,
            label: label.to_string(),
            source: source.to_string(),
        });
        true
    }

    /// Registration is only valid before `start_session` or between
    /// sessions. Registering the same queue twice (by identity) is a no-op.
    pub fn add_sink_queue(&self, q: Arc<DropOldestQueue<Payload>>) -> CoreResult<()> {
        self.register_sink(&self.sinks, q)
    }

    pub fn add_plot_sink_queue(&self, q: Arc<DropOldestQueue<Payload>>) -> CoreResult<()> {
        self.register_sink(&self.plot_sinks, q)
    }

    fn register_sink(
        &self,
        list: &Mutex<Vec<Arc<DropOldestQueue<Payload>>>>,
        q: Arc<DropOldestQueue<Payload>>,
    ) -> CoreResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(CoreError::SinkRegistration(
                "cannot register a sink while a session is running".into(),
            ));
        }
        let mut sinks = list.lock();
        if !sinks.iter().any(|existing| Arc::ptr_eq(existing, &q)) {
            sinks.push(q);
        }
        Ok(())
    }

    pub fn current_event_label(&self) -> String {
        self.event_bus.current_label()
    }

    fn current_quantized_now(&self) -> Option<(f64, i64)> {
        let session = self.session.lock();
        let session = session.as_ref()?;
        let host_ts = session.host_epoch.elapsed().as_secs_f64();
        Some(quantize(host_ts, session.delta, session.decimals))
    }

    fn run_consumer(self: Arc<Self>) {
        loop {
            match self.ingestion.pop_timeout(Duration::from_millis(200)) {
                Pop::Item(item) => {
                    if catch_unwind(AssertUnwindSafe(|| self.handle_item(item))).is_err() {
                        error!("synchronizer consumer: panic handling an ingestion item, continuing");
                    }
                }
                Pop::Timeout => {
                    self.maybe_log_ingestion_drops();
                }
                Pop::Closed => break,
            }
            if self.stop_requested.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    fn maybe_log_ingestion_drops(&self) {
        let count = self.ingestion_drops.count();
        let mut last = self.last_drop_log.lock();
        if count > 0 && (count != last.1) && last.0.elapsed() >= Duration::from_secs(1) {
            warn!(
                "ingestion queue: {} sample(s) dropped (drop-oldest) in the last window",
                count
            );
            *last = (Instant::now(), count);
        }
    }

    fn handle_item(&self, item: IngestItem) {
        match item {
            IngestItem::Sample(packet) => self.handle_sample_packet(packet),
            IngestItem::Event {
                t_q,
                k,
                label,
                prev_label,
                source,
            } => {
                let payload = Payload::Event {
                    t_q,
                    k,
                    label,
                    prev_label,
                    source,
                };
                self.emit_to_full_sinks(&payload);
                self.emit_to_plot_sinks_raw(&payload);
            }
            IngestItem::Spike { t_q, k, label, source } => {
                let payload = Payload::Spike { t_q, k, label, source };
                self.emit_to_full_sinks(&payload);
                self.emit_to_plot_sinks_raw(&payload);
            }
        }
    }

    fn handle_sample_packet(&self, packet: SamplePacket) {
        let (t_q, k, delta) = {
            let session_guard = self.session.lock();
            let session = match session_guard.as_ref() {
                Some(s) => s,
                None => return,
            };
            let host_ts = self.map_to_host(session, &packet.device_name, packet.device_ts);
            let (t_q, k) = quantize(host_ts, session.delta, session.decimals);
            (t_q, k, session.delta)
        };

        let payload = Payload::Sample {
            t_q,
            k,
            device: packet.device_name.clone(),
            channels: packet.channels,
        };
        self.emit_to_full_sinks(&payload);
        self.emit_to_plot_sinks_decimated(&packet.device_name, k, &payload, delta);
    }

    /// First sighting anchors the device; a backward jump resets the anchor
    /// at the current session-relative host time, bumps the epoch, and logs
    /// a warning (§3 DeviceAnchor, S3).
    fn map_to_host(&self, session: &SessionState, device_name: &str, device_ts: f64) -> f64 {
        match self.anchors.entry(device_name.to_string()) {
            Entry::Vacant(v) => {
                let host_ts_at_first = session.host_epoch.elapsed().as_secs_f64();
                v.insert(DeviceAnchor {
                    first_device_ts: device_ts,
                    host_ts_at_first,
                    epoch: 0,
                    last_device_ts: device_ts,
                });
                host_ts_at_first
            }
            Entry::Occupied(mut o) => {
                let anchor = o.get_mut();
                if device_ts < anchor.last_device_ts {
                    warn!(
                        "device '{}': clock moved backward ({} < {}), resetting anchor (epoch {} -> {})",
                        device_name,
                        device_ts,
                        anchor.last_device_ts,
                        anchor.epoch,
                        anchor.epoch + 1
                    );
                    let host_ts_at_first = session.host_epoch.elapsed().as_secs_f64();
                    anchor.epoch += 1;
                    anchor.first_device_ts = device_ts;
                    anchor.host_ts_at_first = host_ts_at_first;
                    anchor.last_device_ts = device_ts;
                    host_ts_at_first
                } else {
                    anchor.last_device_ts = device_ts;
                    anchor.host_ts_at_first + (device_ts - anchor.first_device_ts)
                }
            }
        }
    }

    fn emit_to_full_sinks(&self, payload: &Payload) {
        Self::emit_to(&self.sinks, &self.sink_drops, payload);
    }

    fn emit_to_plot_sinks_raw(&self, payload: &Payload) {
        Self::emit_to(&self.plot_sinks, &self.sink_drops, payload);
    }

    fn emit_to(
        list: &Mutex<Vec<Arc<DropOldestQueue<Payload>>>>,
        drops: &DashMap<usize, AtomicU64>,
        payload: &Payload,
    ) {
        for sink in list.lock().iter() {
            if !sink.try_offer(payload.clone()) {
                let key = Arc::as_ptr(sink) as usize;
                drops
                    .entry(key)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn emit_to_plot_sinks_decimated(&self, device: &str, k: i64, payload: &Payload, delta: f64) {
        if self.cfg.plot_decimate_hz <= 0.0 {
            self.emit_to_plot_sinks_raw(payload);
            return;
        }
        let bin_width = (1.0 / (delta * self.cfg.plot_decimate_hz)).ceil().max(1.0) as i64;
        let forward = match self.last_emitted_k.get(device) {
            Some(last) => k - *last >= bin_width,
            None => true,
        };
        if forward {
            self.last_emitted_k.insert(device.to_string(), k);
            self.emit_to_plot_sinks_raw(payload);
        }
    }
}
