//! Streaming second-order-section (SOS) IIR filter engine (component A, §4.5).
//!
//! The cascade itself (`SosCascade`) is an immutable, cheaply-`Arc`-cloned
//! design artifact, memoized process-wide by `design_sos`. Per-channel state
//! (`StreamingSOS`) is never shared: each `(device_instance, channel)` pair
//! owns its own `zi` buffer seeded from the cascade's section count.
//!
//! Sections are plain direct-form-II-transposed biquads (`b0, b1, b2, a1,
//! a2`, `a0` implicitly normalized to 1), the same shape the `idsp::iir`
//! cascades stabilizer's dual-IIR application composes ADC-rate filters
//! from — this engine keeps that cascade-of-biquads architecture but runs on
//! the host, against `f64`, with a cache keyed by a canonicalized spec
//! instead of being designed once at firmware build time.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

/// Sentinel marking a missing sample. Filtering and quantization must let it
/// pass through unchanged.
pub const MISSING: f64 = f64::NAN;

#[inline]
pub fn is_missing(x: f64) -> bool {
    x.is_nan()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandPassSpec {
    pub order: u32,
    pub low_hz: f64,
    pub high_hz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotchSpec {
    pub freq_hz: f64,
    pub q: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterSpec {
    pub band_pass: Option<BandPassSpec>,
    pub notch: Option<NotchSpec>,
}

/// Fixed-decimal canonicalization of a [`FilterSpec`] so semantically
/// identical floating-point specs hash to the same cache key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CanonicalKey {
    sensor_key: String,
    fs_fixed: i64,
    band_pass: Option<(u32, i64, i64)>,
    notch: Option<(i64, i64)>,
}

fn to_fixed(x: f64) -> i64 {
    (x * 1_000_000.0).round() as i64
}

fn canonicalize(sensor_key: &str, fs: f64, spec: &FilterSpec) -> CanonicalKey {
    CanonicalKey {
        sensor_key: sensor_key.to_string(),
        fs_fixed: to_fixed(fs),
        band_pass: spec
            .band_pass
            .map(|b| (b.order, to_fixed(b.low_hz), to_fixed(b.high_hz))),
        notch: spec.notch.map(|n| (to_fixed(n.freq_hz), to_fixed(n.q))),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SosSection {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

/// An immutable composed filter: notch section(s) first, then band-pass
/// section(s), per the build order in §4.5. Empty means "pass-through".
#[derive(Debug, Clone, Default)]
pub struct SosCascade {
    pub sections: Vec<SosSection>,
}

impl SosCascade {
    fn identity() -> Self {
        Self { sections: Vec::new() }
    }
}

/// Validates the design inputs against §4.5's rules. Returns the clamped
/// notch spec (invalid frequencies default to 50 Hz) or `None` if the whole
/// spec is rejected outright (band-pass edge violations).
fn validate(fs: f64, spec: &FilterSpec) -> Option<FilterSpec> {
    let mut out = *spec;

    if let Some(n) = out.notch {
        if n.freq_hz != 50.0 && n.freq_hz != 60.0 {
            warn!(
                "filter design: notch frequency {}Hz is not 50/60Hz, defaulting to 50Hz",
                n.freq_hz
            );
            out.notch = Some(NotchSpec { freq_hz: 50.0, q: n.q });
        }
    }

    if let Some(b) = out.band_pass {
        if !(b.low_hz > 0.0 && b.high_hz < fs / 2.0 && b.low_hz < b.high_hz && b.order >= 1) {
            warn!(
                "filter design: invalid band-pass spec ({:?}) for fs={}, degrading to identity",
                b, fs
            );
            return None;
        }
    }

    Some(out)
}

fn notch_section(n: NotchSpec, fs: f64) -> SosSection {
    let w0 = 2.0 * std::f64::consts::PI * n.freq_hz / fs;
    let alpha = w0.sin() / (2.0 * n.q.max(1e-6));
    let cos_w0 = w0.cos();
    let a0 = 1.0 + alpha;
    SosSection {
        b0: 1.0 / a0,
        b1: (-2.0 * cos_w0) / a0,
        b2: 1.0 / a0,
        a1: (-2.0 * cos_w0) / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn band_pass_section(b: BandPassSpec, fs: f64) -> SosSection {
    let center = (b.low_hz * b.high_hz).sqrt();
    let bandwidth = b.high_hz - b.low_hz;
    let q = (center / bandwidth).max(1e-6) * b.order as f64;
    let w0 = 2.0 * std::f64::consts::PI * center / fs;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let a0 = 1.0 + alpha;
    SosSection {
        b0: alpha / a0,
        b1: 0.0,
        b2: -alpha / a0,
        a1: (-2.0 * cos_w0) / a0,
        a2: (1.0 - alpha) / a0,
    }
}

/// Process-wide, bounded, memoized cascade factory (§4.5, §8: `design_sos`
/// must be behaviorally idempotent for the same spec).
pub struct FilterDesignCache {
    capacity: usize,
    entries: Mutex<HashMap<u64, (CanonicalKey, Arc<SosCascade>)>>,
    order: Mutex<Vec<u64>>,
}

impl FilterDesignCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn design(&self, sensor_key: &str, fs: f64, spec: &FilterSpec) -> Arc<SosCascade> {
        let key = canonicalize(sensor_key, fs, spec);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();

        {
            let entries = self.entries.lock();
            if let Some((_, cascade)) = entries.get(&hash) {
                return cascade.clone();
            }
        }

        let cascade = Arc::new(build_cascade(fs, spec));

        let mut entries = self.entries.lock();
        let mut order = self.order.lock();
        if !entries.contains_key(&hash) {
            if order.len() >= self.capacity {
                if let Some(evict) = order.first().copied() {
                    entries.remove(&evict);
                    order.remove(0);
                }
            }
            entries.insert(hash, (key, cascade.clone()));
            order.push(hash);
        }
        entries.get(&hash).unwrap().1.clone()
    }
}

fn build_cascade(fs: f64, spec: &FilterSpec) -> SosCascade {
    let spec = match validate(fs, spec) {
        Some(s) => s,
        None => return SosCascade::identity(),
    };

    let mut sections = Vec::new();
    if let Some(n) = spec.notch {
        sections.push(notch_section(n, fs));
    }
    if let Some(b) = spec.band_pass {
        for _ in 0..b.order {
            sections.push(band_pass_section(b, fs));
        }
    }
    SosCascade { sections }
}

/// Per-channel streaming state over a shared, immutable cascade.
pub struct StreamingSOS {
    cascade: Arc<SosCascade>,
    zi: Vec<[f64; 2]>,
    context_tag: String,
    tripped: AtomicBool,
}

impl StreamingSOS {
    pub fn new(cascade: Arc<SosCascade>, context_tag: impl Into<String>) -> Self {
        let zi = vec![[0.0; 2]; cascade.sections.len()];
        Self {
            cascade,
            zi,
            context_tag: context_tag.into(),
            tripped: AtomicBool::new(false),
        }
    }

    /// Feeds `x` through every section, updating `zi`. Missing samples pass
    /// through untouched and never perturb the filter state (§8 invariant 5).
    pub fn apply(&mut self, x: f64) -> f64 {
        if is_missing(x) {
            return MISSING;
        }
        if self.tripped.load(Ordering::Relaxed) {
            return x;
        }

        let mut y = x;
        for (section, state) in self.cascade.sections.iter().zip(self.zi.iter_mut()) {
            let out = section.b0 * y + state[0];
            state[0] = section.b1 * y + state[1] - section.a1 * out;
            state[1] = section.b2 * y - section.a2 * out;
            y = out;
        }

        if !y.is_finite() {
            if !self.tripped.swap(true, Ordering::Relaxed) {
                warn!(
                    "streaming SOS [{}]: non-finite output, degrading to pass-through for the rest of the session",
                    self.context_tag
                );
            }
            return x;
        }

        y
    }

    pub fn reset(&mut self) {
        for state in self.zi.iter_mut() {
            *state = [0.0; 2];
        }
        self.tripped.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_cascade_on_invalid_spec_logs_and_degrades() {
        let cache = FilterDesignCache::new(8);
        let spec = FilterSpec {
            band_pass: Some(BandPassSpec {
                order: 1,
                low_hz: 10.0,
                high_hz: 5.0, // invalid: low > high
            }),
            notch: None,
        };
        let cascade = cache.design("gsr", 100.0, &spec);
        assert!(cascade.sections.is_empty());
    }

    #[test]
    fn design_sos_is_memoized_by_canonical_spec() {
        let cache = FilterDesignCache::new(8);
        let spec = FilterSpec {
            band_pass: Some(BandPassSpec {
                order: 2,
                low_hz: 1.0,
                high_hz: 40.0,
            }),
            notch: Some(NotchSpec { freq_hz: 50.0, q: 30.0 }),
        };
        let a = cache.design("eeg", 250.0, &spec);
        let b = cache.design("eeg", 250.0000001, &spec); // same after fixed-decimal rounding
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn notch_freq_coerced_to_50hz() {
        let cache = FilterDesignCache::new(8);
        let spec = FilterSpec {
            band_pass: None,
            notch: Some(NotchSpec { freq_hz: 55.0, q: 30.0 }),
        };
        let cascade = cache.design("ecg", 250.0, &spec);
        assert_eq!(cascade.sections.len(), 1);
    }

    #[test]
    fn apply_passes_missing_through_without_advancing_state() {
        let cascade = Arc::new(build_cascade(
            250.0,
            &FilterSpec {
                band_pass: Some(BandPassSpec {
                    order: 2,
                    low_hz: 1.0,
                    high_hz: 40.0,
                }),
                notch: None,
            },
        ));
        let mut with_gap = StreamingSOS::new(cascade.clone(), "with_gap");
        let mut without_gap = StreamingSOS::new(cascade, "without_gap");

        let a1 = with_gap.apply(1.0);
        let out_missing = with_gap.apply(MISSING);
        let a2 = with_gap.apply(1.0);

        let b1 = without_gap.apply(1.0);
        let b2 = without_gap.apply(1.0);

        assert!(is_missing(out_missing));
        assert_eq!(a1, b1);
        assert_eq!(a2, b2);
    }

    #[test]
    fn reset_rezeroes_state() {
        let cascade = Arc::new(build_cascade(
            250.0,
            &FilterSpec {
                band_pass: Some(BandPassSpec {
                    order: 1,
                    low_hz: 1.0,
                    high_hz: 40.0,
                }),
                notch: None,
            },
        ));
        let mut s = StreamingSOS::new(cascade, "reset_test");
        s.apply(1.0);
        s.apply(1.0);
        s.reset();
        assert!(s.zi.iter().all(|z| *z == [0.0, 0.0]));
    }
}
