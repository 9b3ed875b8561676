//! Exporter: order-preserving row assembly across k-bins with late-packet
//! lookahead tolerance, periodic/idle flush, and a markers sidecar
//! (component E, §4.7).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, warn};
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::queue::{DropOldestQueue, Pop};
use crate::sync::{compute_decimals, Payload};

pub struct ExporterOptions {
    pub session_id: String,
    /// Ordered, deduplicated `device:channel` schema (§4.7, from
    /// `collect_known_channels_from_config`).
    pub schema: Vec<String>,
    pub fs_max: f64,
    pub lookahead_sec: f64,
    pub flush_period_sec: f64,
    /// `<= 0` derives a value from `fs_max`/`flush_period_sec`.
    pub flush_rows: i64,
    pub idle_watermark_sec: f64,
    pub include_k_column: bool,
    pub enable_signal_csv: bool,
    pub enable_marker_csv: bool,
    pub signal_dir: PathBuf,
    pub marker_dir: PathBuf,
    pub default_event_label: String,
    /// Capacity of the exporter's own sink queue; `<= 0` is unbounded.
    pub sink_queue_capacity: i64,
}

fn derive_lookahead_rows(lookahead_sec: f64, fs_max: f64) -> i64 {
    ((lookahead_sec * fs_max).round() as i64).max(0)
}

fn derive_flush_rows(configured: i64, fs_max: f64, flush_period_sec: f64) -> usize {
    if configured > 0 {
        return configured as usize;
    }
    ((fs_max * flush_period_sec).round() as i64).clamp(64, 2048) as usize
}

struct OpenRow {
    t_q: f64,
    channels: HashMap<String, f64>,
    spike: Option<String>,
    event_override: Option<String>,
}

impl OpenRow {
    fn new(t_q: f64) -> Self {
        Self {
            t_q,
            channels: HashMap::new(),
            spike: None,
            event_override: None,
        }
    }
}

pub struct Exporter {
    session_id: String,
    schema: Vec<String>,
    schema_set: HashSet<String>,
    decimals: usize,
    lookahead_rows: i64,
    flush_rows: usize,
    flush_period: Duration,
    idle_watermark: Duration,
    include_k_column: bool,
    enable_signal_csv: bool,
    enable_marker_csv: bool,
    signal_dir: PathBuf,
    marker_dir: PathBuf,

    queue: Arc<DropOldestQueue<Payload>>,
    started: AtomicBool,

    open_rows: Mutex<BTreeMap<i64, OpenRow>>,
    k_seen_max: AtomicI64,
    sticky_event: Mutex<String>,
    rows_since_flush: AtomicU64,
    last_flush: Mutex<Instant>,
    last_packet: Mutex<Instant>,
    idle_logged: AtomicBool,

    signal_writer: Mutex<Option<csv::Writer<fs::File>>>,
    marker_writer: Mutex<Option<csv::Writer<fs::File>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<Exporter>,
}

impl Exporter {
    pub fn new(opts: ExporterOptions) -> Arc<Self> {
        let delta = 1.0 / opts.fs_max.max(1e-9);
        let decimals = compute_decimals(delta);
        let lookahead_rows = derive_lookahead_rows(opts.lookahead_sec, opts.fs_max);
        let flush_rows = derive_flush_rows(opts.flush_rows, opts.fs_max, opts.flush_period_sec);
        let schema_set = opts.schema.iter().cloned().collect();
        let now = Instant::now();

        Arc::new_cyclic(|weak| Self {
            session_id: opts.session_id,
            schema: opts.schema,
            schema_set,
            decimals,
            lookahead_rows,
            flush_rows,
            flush_period: Duration::from_secs_f64(opts.flush_period_sec.max(0.0)),
            idle_watermark: Duration::from_secs_f64(opts.idle_watermark_sec.max(0.0)),
            include_k_column: opts.include_k_column,
            enable_signal_csv: opts.enable_signal_csv,
            enable_marker_csv: opts.enable_marker_csv,
            signal_dir: opts.signal_dir,
            marker_dir: opts.marker_dir,

            queue: Arc::new(DropOldestQueue::new(opts.sink_queue_capacity)),
            started: AtomicBool::new(false),

            open_rows: Mutex::new(BTreeMap::new()),
            k_seen_max: AtomicI64::new(i64::MIN),
            sticky_event: Mutex::new(opts.default_event_label),
            rows_since_flush: AtomicU64::new(0),
            last_flush: Mutex::new(now),
            last_packet: Mutex::new(now),
            idle_logged: AtomicBool::new(false),

            signal_writer: Mutex::new(None),
            marker_writer: Mutex::new(None),
            worker_handle: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// The queue to register with a `Synchronizer` via `add_sink_queue`.
    pub fn queue(&self) -> Arc<DropOldestQueue<Payload>> {
        self.queue.clone()
    }

    fn open_files(&self) -> CoreResult<()> {
        if self.enable_signal_csv {
            fs::create_dir_all(&self.signal_dir)?;
            let path = self.signal_dir.join(format!("synced_{}.csv", self.session_id));
            let mut writer = csv::WriterBuilder::new().from_path(&path)?;
            let mut header = Vec::new();
            if self.include_k_column {
                header.push("k".to_string());
            }
            header.push("t_q".to_string());
            header.extend(self.schema.iter().cloned());
            header.push("spike".to_string());
            header.push("event".to_string());
            writer.write_record(&header)?;
            *self.signal_writer.lock() = Some(writer);
        }

        if self.enable_marker_csv {
            fs::create_dir_all(&self.marker_dir)?;
            let path = self.marker_dir.join(format!("markers_{}.csv", self.session_id));
            let mut writer = csv::WriterBuilder::new().from_path(&path)?;
            writer.write_record(["t_q", "event", "spike", "source"])?;
            *self.marker_writer.lock() = Some(writer);
        }

        Ok(())
    }

    pub fn start(&self) -> CoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyStarted);
        }
        self.open_files()?;
        let now = Instant::now();
        *self.last_flush.lock() = now;
        *self.last_packet.lock() = now;
        self.idle_logged.store(false, Ordering::Relaxed);

        let worker = self
            .self_weak
            .upgrade()
            .expect("exporter dropped while starting");
        let handle = std::thread::spawn(move || worker.run_worker());
        *self.worker_handle.lock() = Some(handle);
        Ok(())
    }

    /// Safe to call even if `start` was never called; a double call is a
    /// no-op. Uses `close()` (drain-to-completion), not `close_discard()`:
    /// the exporter must finish committing whatever the consumer already
    /// delivered before stop.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        if let Some(handle) = self.worker_handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            match self.queue.pop_timeout(self.flush_period) {
                Pop::Item(payload) => {
                    if catch_unwind(AssertUnwindSafe(|| self.handle_payload(payload))).is_err() {
                        error!("exporter worker: panic handling a payload, continuing");
                    }
                    *self.last_packet.lock() = Instant::now();
                    self.idle_logged.store(false, Ordering::Relaxed);
                    self.checkpoint();
                }
                Pop::Timeout => self.checkpoint(),
                Pop::Closed => break,
            }
        }
        self.commit_until(i64::MAX);
        self.flush_files();
    }

    fn checkpoint(&self) {
        let k_seen_max = self.k_seen_max.load(Ordering::Relaxed);
        if k_seen_max > i64::MIN {
            self.commit_until(k_seen_max - self.lookahead_rows);
        }

        let should_flush = self.rows_since_flush.load(Ordering::Relaxed) as usize >= self.flush_rows
            || self.last_flush.lock().elapsed() >= self.flush_period;
        if should_flush {
            self.flush_files();
        }

        if self.last_packet.lock().elapsed() >= self.idle_watermark {
            self.commit_until(i64::MAX);
            self.flush_files();
            if !self.idle_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    "exporter idle for >= {:?}; committed all open rows",
                    self.idle_watermark
                );
            }
        }
    }

    fn handle_payload(&self, payload: Payload) {
        match payload {
            Payload::Sample { t_q, k, device, channels } => {
                let mut rows = self.open_rows.lock();
                let row = rows.entry(k).or_insert_with(|| OpenRow::new(t_q));
                for (channel, value) in channels {
                    if let Some(key) = self.resolve_schema_key(&device, &channel) {
                        row.channels.insert(key, value);
                    }
                }
                drop(rows);
                self.k_seen_max.fetch_max(k, Ordering::Relaxed);
            }
            Payload::Event {
                t_q,
                k,
                label,
                prev_label: _,
                source,
            } => {
                self.write_marker_row(t_q, Some(&label), None, &source);
                let mut rows = self.open_rows.lock();
                let row = rows.entry(k).or_insert_with(|| OpenRow::new(t_q));
                row.event_override = Some(label);
                drop(rows);
                self.k_seen_max.fetch_max(k, Ordering::Relaxed);
            }
            Payload::Spike { t_q, k, label, source } => {
                self.write_marker_row(t_q, None, Some(&label), &source);
                // A spike targeting an already-committed k is recorded only
                // in the markers sidecar; a committed signal row is never
                // rewritten (§8 invariant 6, open question #1).
                if let Some(row) = self.open_rows.lock().get_mut(&k) {
                    row.spike = Some(label);
                }
            }
        }
    }

    /// Tries the `device:channel` composite key first (§4.7's schema shape),
    /// falling back to the bare channel name (§3's worked examples use bare
    /// names) so neither form is silently dropped.
    fn resolve_schema_key(&self, device: &str, channel: &str) -> Option<String> {
        let composite = format!("{device}:{channel}");
        if self.schema_set.contains(&composite) {
            return Some(composite);
        }
        if self.schema_set.contains(channel) {
            return Some(channel.to_string());
        }
        None
    }

    /// Commits every open row with `k <= k_cap`, in ascending order.
    fn commit_until(&self, k_cap: i64) {
        let ready: Vec<i64> = {
            let rows = self.open_rows.lock();
            rows.keys().take_while(|&&k| k <= k_cap).copied().collect()
        };
        for k in ready {
            self.commit_row(k);
        }
    }

    fn commit_row(&self, k: i64) {
        let row = match self.open_rows.lock().remove(&k) {
            Some(row) => row,
            None => return,
        };

        let event_label = {
            let mut sticky = self.sticky_event.lock();
            if let Some(label) = &row.event_override {
                *sticky = label.clone();
            }
            sticky.clone()
        };

        if self.enable_signal_csv {
            if let Err(e) = self.write_signal_row(k, &row, &event_label) {
                error!("exporter: failed writing signal row for k={}: {}", k, e);
            }
        }
        self.rows_since_flush.fetch_add(1, Ordering::Relaxed);
    }

    fn fmt_num(&self, x: f64) -> String {
        if crate::filter::is_missing(x) {
            String::new()
        } else {
            format!("{:.*}", self.decimals, x)
        }
    }

    fn write_signal_row(&self, k: i64, row: &OpenRow, event_label: &str) -> CoreResult<()> {
        let mut guard = self.signal_writer.lock();
        let writer = match guard.as_mut() {
            Some(w) => w,
            None => return Ok(()),
        };

        let mut record = Vec::with_capacity(self.schema.len() + 4);
        if self.include_k_column {
            record.push(k.to_string());
        }
        record.push(format!("{:.*}", self.decimals, row.t_q));
        for column in &self.schema {
            let cell = row
                .channels
                .get(column)
                .map(|v| self.fmt_num(*v))
                .unwrap_or_default();
            record.push(cell);
        }
        record.push(row.spike.clone().unwrap_or_default());
        record.push(event_label.to_string());

        writer.write_record(&record)?;
        Ok(())
    }

    fn write_marker_row(&self, t_q: f64, event: Option<&str>, spike: Option<&str>, source: &str) {
        if !self.enable_marker_csv {
            return;
        }
        let mut guard = self.marker_writer.lock();
        let writer = match guard.as_mut() {
            Some(w) => w,
            None => return,
        };
        let record = [
            format!("{:.*}", self.decimals, t_q),
            event.unwrap_or_default().to_string(),
            spike.unwrap_or_default().to_string(),
            source.to_string(),
        ];
        if let Err(e) = writer.write_record(&record) {
            error!("exporter: failed writing marker row: {}", e);
        }
    }

    fn flush_files(&self) {
        if let Some(w) = self.signal_writer.lock().as_mut() {
            if let Err(e) = w.flush() {
                error!("exporter: failed flushing signal csv: {}", e);
            }
        }
        if let Some(w) = self.marker_writer.lock().as_mut() {
            if let Err(e) = w.flush() {
                error!("exporter: failed flushing marker csv: {}", e);
            }
        }
        *self.last_flush.lock() = Instant::now();
        self.rows_since_flush.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn opts(dir: &tempfile::TempDir) -> ExporterOptions {
        ExporterOptions {
            session_id: "test".into(),
            schema: vec!["devA:chA".into(), "devB:chB".into()],
            fs_max: 100.0,
            lookahead_sec: 0.1,
            flush_period_sec: 1.0,
            flush_rows: 0,
            idle_watermark_sec: 2.0,
            include_k_column: true,
            enable_signal_csv: true,
            enable_marker_csv: true,
            signal_dir: dir.path().join("synced"),
            marker_dir: dir.path().join("markers"),
            default_event_label: "REST".into(),
            sink_queue_capacity: 0,
        }
    }

    fn read_to_string(path: &std::path::Path) -> String {
        let mut s = String::new();
        fs::File::open(path).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn derives_lookahead_and_flush_rows() {
        assert_eq!(derive_lookahead_rows(0.1, 100.0), 10);
        assert_eq!(derive_flush_rows(0, 100.0, 1.0), 100);
        assert_eq!(derive_flush_rows(0, 1.0, 1.0), 64); // clamped to the floor
        assert_eq!(derive_flush_rows(5000, 100.0, 1.0), 5000); // explicit wins
    }

    #[test]
    fn s1_two_devices_one_event_clean_export() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(opts(&dir));
        exporter.open_files().unwrap();

        exporter.handle_payload(Payload::Sample {
            t_q: 0.000,
            k: 0,
            device: "devA".into(),
            channels: vec![("chA".into(), 1.0)],
        });
        exporter.handle_payload(Payload::Event {
            t_q: 0.003,
            k: 0,
            label: "TASK".into(),
            prev_label: "REST".into(),
            source: "keyboard".into(),
        });
        exporter.handle_payload(Payload::Sample {
            t_q: 0.003,
            k: 0,
            device: "devB".into(),
            channels: vec![("chB".into(), 9.0)],
        });
        exporter.handle_payload(Payload::Sample {
            t_q: 0.010,
            k: 1,
            device: "devA".into(),
            channels: vec![("chA".into(), 2.0)],
        });

        exporter.commit_until(i64::MAX);
        exporter.flush_files();

        let signal = read_to_string(&dir.path().join("synced/synced_test.csv"));
        let mut lines = signal.lines();
        assert_eq!(lines.next().unwrap(), "k,t_q,devA:chA,devB:chB,spike,event");
        assert_eq!(lines.next().unwrap(), "0,0.000,1.000,9.000,,TASK");
        assert_eq!(lines.next().unwrap(), "1,0.010,2.000,,,TASK");

        let markers = read_to_string(&dir.path().join("markers/markers_test.csv"));
        let mut marker_lines = markers.lines();
        assert_eq!(marker_lines.next().unwrap(), "t_q,event,spike,source");
        assert_eq!(marker_lines.next().unwrap(), "0.003,TASK,,keyboard");
    }

    #[test]
    fn lookahead_holds_back_rows_until_later_k_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(opts(&dir));
        exporter.open_files().unwrap();

        for k in 0..5 {
            exporter.handle_payload(Payload::Sample {
                t_q: k as f64 * 0.01,
                k,
                device: "devA".into(),
                channels: vec![("chA".into(), k as f64)],
            });
        }
        // lookahead_rows = 10; k_seen_max = 4, so nothing should commit yet.
        exporter.checkpoint();
        assert_eq!(exporter.open_rows.lock().len(), 5);

        for k in 5..15 {
            exporter.handle_payload(Payload::Sample {
                t_q: k as f64 * 0.01,
                k,
                device: "devA".into(),
                channels: vec![("chA".into(), k as f64)],
            });
        }
        exporter.checkpoint();
        // k_seen_max = 14, cap = 4: rows 0..=4 committed, 5..=14 still open.
        assert_eq!(exporter.open_rows.lock().len(), 10);
    }

    #[test]
    fn spike_on_already_committed_k_is_marker_only_s1_open_question() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(opts(&dir));
        exporter.open_files().unwrap();

        exporter.handle_payload(Payload::Sample {
            t_q: 0.0,
            k: 0,
            device: "devA".into(),
            channels: vec![("chA".into(), 1.0)],
        });
        exporter.commit_until(i64::MAX);
        assert!(exporter.open_rows.lock().is_empty());

        // Late spike for an already-committed k: must not panic or resurrect the row.
        exporter.handle_payload(Payload::Spike {
            t_q: 0.0,
            k: 0,
            label: "STIM".into(),
            source: "marker".into(),
        });
        assert!(exporter.open_rows.lock().is_empty());

        exporter.flush_files();
        let markers = read_to_string(&dir.path().join("markers/markers_test.csv"));
        assert!(markers.contains("STIM"));
    }

    #[test]
    fn missing_sample_is_an_empty_csv_cell() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(opts(&dir));
        exporter.open_files().unwrap();

        exporter.handle_payload(Payload::Sample {
            t_q: 0.0,
            k: 0,
            device: "devA".into(),
            channels: vec![("chA".into(), crate::filter::MISSING)],
        });
        exporter.commit_until(i64::MAX);
        exporter.flush_files();

        let signal = read_to_string(&dir.path().join("synced/synced_test.csv"));
        let data_row = signal.lines().nth(1).unwrap();
        assert_eq!(data_row, "0,0.000,,,,REST");
    }

    #[test]
    fn idle_watermark_force_commits_all_open_rows_s6() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts(&dir);
        o.idle_watermark_sec = 0.0; // force-trip immediately for a deterministic test
        let exporter = Exporter::new(o);
        exporter.open_files().unwrap();

        for k in 0..5 {
            exporter.handle_payload(Payload::Sample {
                t_q: k as f64 * 0.01,
                k,
                device: "devA".into(),
                channels: vec![("chA".into(), k as f64)],
            });
        }
        std::thread::sleep(Duration::from_millis(5));
        exporter.checkpoint();
        assert!(exporter.open_rows.lock().is_empty());
        assert!(exporter.idle_logged.load(Ordering::Relaxed));

        // Still idle on the next tick: the warning must not fire again.
        exporter.checkpoint();
        assert!(exporter.idle_logged.load(Ordering::Relaxed));

        // A fresh payload ends the idle episode; the next idle tick may warn again.
        *exporter.last_packet.lock() = Instant::now();
        exporter.idle_logged.store(false, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        exporter.checkpoint();
        assert!(exporter.idle_logged.load(Ordering::Relaxed));
    }
}
