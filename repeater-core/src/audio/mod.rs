//! Device I/O: frame sources, sample sinks, and the cpal backend.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They **must not**
//! block on a mutex, perform I/O, or allocate in steady state. Input callbacks
//! therefore only downmix and push into an SPSC ring; output callbacks only pop
//! from one and emit silence on underrun, which also keeps an idle output
//! stream alive between playbacks.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Sources and sinks are therefore opened through an [`AudioBackend`]
//! *on the engine loop thread* that will use and drop them, and the boxed
//! trait objects carry no `Send` bound.

pub mod device;
pub mod memory;
pub mod wav;

#[cfg(feature = "audio-cpal")]
pub mod capture;
#[cfg(feature = "audio-cpal")]
pub mod playback;

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffering::frame::AudioFrame;
use crate::error::{RepeaterError, Result};

/// Fixed device sample rate (Hz) for input and output.
pub const SAMPLE_RATE: u32 = 44_100;

/// Fixed frame length in samples.
pub const FRAME_SAMPLES: usize = 1024;

/// Wall-clock length of one frame (1024 / 44100 s ≈ 23.2 ms).
pub const FRAME_PERIOD: Duration = Duration::from_micros(23_220);

/// Poll interval while waiting on a ring buffer.
pub(crate) const RING_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Supplies input frames.
pub trait FrameSource {
    /// Wait up to `timeout` for the next full frame. `Ok(None)` on timeout.
    ///
    /// # Errors
    /// A device error (disconnect, stream failure). The caller stops its loop.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>>;

    /// Drop everything already captured but not yet read. Returns samples dropped.
    fn discard_pending(&mut self) -> usize {
        0
    }
}

/// Consumes output samples.
pub trait FrameSink {
    /// Queue samples for output, waiting at most `timeout` for room.
    /// Returns how many samples were accepted (possibly 0).
    fn write(&mut self, samples: &[i16], timeout: Duration) -> Result<usize>;
}

/// Opens sources and sinks on the calling thread.
pub trait AudioBackend: Send + Sync + 'static {
    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn FrameSource>>;
    fn open_output(&self, device: Option<&str>) -> Result<Box<dyn FrameSink>>;
}

/// Device names chosen by the host. `None` means the system default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelection {
    pub input: Option<String>,
    pub output: Option<String>,
}

/// Error latch written by a stream's error callback and read by the loop.
#[derive(Debug, Default)]
pub struct StreamFault {
    message: Mutex<Option<String>>,
}

impl StreamFault {
    pub fn raise(&self, message: impl Into<String>) {
        let mut slot = self.message.lock();
        // Keep the first failure; later ones are usually consequences.
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    /// Turn a raised fault into the error the loop should stop with.
    pub fn check(&self) -> Result<()> {
        match self.message.lock().as_ref() {
            Some(msg) => Err(RepeaterError::DeviceDisconnected(msg.clone())),
            None => Ok(()),
        }
    }
}

/// Convert a float sample in [-1, 1] to `i16` with saturation.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32_767.0).round().clamp(-32_768.0, 32_767.0) as i16
}

/// Convert an `i16` sample to float in [-1, 1).
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32_768.0
}

/// Real devices via cpal, with an optional WAV file standing in for the input.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_wav: Option<PathBuf>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read input from a 16-bit mono 44.1 kHz WAV file instead of a device.
    pub fn with_input_wav(path: impl Into<PathBuf>) -> Self {
        Self {
            input_wav: Some(path.into()),
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn FrameSource>> {
        if let Some(path) = &self.input_wav {
            return Ok(Box::new(wav::WavSource::open(path)?));
        }
        open_device_input(device)
    }

    fn open_output(&self, device: Option<&str>) -> Result<Box<dyn FrameSink>> {
        open_device_output(device)
    }
}

#[cfg(feature = "audio-cpal")]
fn open_device_input(device: Option<&str>) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(capture::CpalInput::open(device)?))
}

#[cfg(feature = "audio-cpal")]
fn open_device_output(device: Option<&str>) -> Result<Box<dyn FrameSink>> {
    Ok(Box::new(playback::CpalOutput::open(device)?))
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
fn open_device_input(_device: Option<&str>) -> Result<Box<dyn FrameSource>> {
    Err(RepeaterError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

#[cfg(not(feature = "audio-cpal"))]
fn open_device_output(_device: Option<&str>) -> Result<Box<dyn FrameSink>> {
    Err(RepeaterError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_period_matches_frame_length() {
        let exact = FRAME_SAMPLES as f64 / SAMPLE_RATE as f64;
        assert!((FRAME_PERIOD.as_secs_f64() - exact).abs() < 1e-5);
    }

    #[test]
    fn float_conversion_saturates() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn stream_fault_keeps_first_message() {
        let fault = StreamFault::default();
        assert!(fault.check().is_ok());
        fault.raise("device unplugged");
        fault.raise("follow-up failure");
        match fault.check() {
            Err(RepeaterError::DeviceDisconnected(msg)) => assert_eq!(msg, "device unplugged"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
