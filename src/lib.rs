//! `sigsync_core` — the time-alignment and fan-out core of a real-time
//! multi-device physiological signal acquisition pipeline.
//!
//! Producers (external to this crate: serial biosensors, an LSL stream,
//! synthetic generators, marker injectors) call into the SOS filter engine
//! per sample if filtering is configured, then enqueue a packet on the
//! [`sync::Synchronizer`]. Its single consumer thread anchors each device's
//! clock, quantizes onto a shared grid, and fans payloads out to every
//! registered sink — a live plot and the [`export::Exporter`] being the two
//! this crate ships. Sticky state events ([`events::EventBus`]) and one-shot
//! spikes ([`spikes::SpikeBus`]) are injected from any thread and routed
//! through the same consumer loop so they interleave correctly with samples.

pub mod bus;
pub mod config;
pub mod contracts;
pub mod error;
pub mod events;
pub mod export;
pub mod filter;
pub mod queue;
pub mod spikes;
pub mod sync;
pub mod telemetry;

pub use error::{CoreError, CoreResult};
pub use export::{Exporter, ExporterOptions};
pub use sync::{Payload, SyncConfig, Synchronizer};
