//! # repeater-core
//!
//! Threshold-triggered audio repeater engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Simplex:
//!   Input → FrameSource → LevelDetector ─► RecordGate ─► CaptureBuffer
//!                                                            │ (after recording)
//!                                      Output ◄─ FrameSink ◄─ Equalizer
//!
//! Duplex:
//!   Input → capture thread (RecordGate) ─► bounded FIFO ─► playback thread → Equalizer → Output
//! ```
//!
//! Device callbacks only move samples through SPSC rings. All heap work and
//! every control decision happens on the engine loop threads, which publish
//! level and state observations over `tokio::sync::broadcast`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod level;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, CpalBackend, DeviceSelection};
pub use engine::{ConfigUpdate, EngineConfig, RepeaterEngine, RepeaterMode};
pub use error::RepeaterError;
pub use ipc::events::{
    CaptureState, EngineStatus, EngineStatusEvent, LevelEvent, PlaybackState, SimplexState,
    StateSnapshot,
};
