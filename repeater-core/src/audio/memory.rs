//! In-memory devices for headless runs and tests.
//!
//! [`MemoryBackend::new`] returns the backend plus two handles: a
//! [`MemoryFeed`] that plays the role of the microphone, and an
//! [`OutputCapture`] that records everything written to the "speaker".

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use super::{AudioBackend, FrameSink, FrameSource};
use crate::buffering::frame::AudioFrame;
use crate::error::{RepeaterError, Result};

/// Backend whose input is fed by hand and whose output is collected.
#[derive(Clone)]
pub struct MemoryBackend {
    frames: Receiver<AudioFrame>,
    output: OutputCapture,
    fail_input: Option<String>,
    fail_output: Option<String>,
}

/// Pushes frames into the memory input.
#[derive(Clone)]
pub struct MemoryFeed {
    tx: Sender<AudioFrame>,
}

/// Shared record of every sample accepted by memory sinks.
#[derive(Clone, Default)]
pub struct OutputCapture {
    inner: Arc<(Mutex<Vec<i16>>, Condvar)>,
}

impl MemoryBackend {
    pub fn new() -> (Self, MemoryFeed, OutputCapture) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let output = OutputCapture::default();
        (
            Self {
                frames: rx,
                output: output.clone(),
                fail_input: None,
                fail_output: None,
            },
            MemoryFeed { tx },
            output,
        )
    }

    /// Make `open_input` fail with a device error.
    pub fn failing_input(mut self, message: impl Into<String>) -> Self {
        self.fail_input = Some(message.into());
        self
    }

    /// Make `open_output` fail with a device error.
    pub fn failing_output(mut self, message: impl Into<String>) -> Self {
        self.fail_output = Some(message.into());
        self
    }
}

impl AudioBackend for MemoryBackend {
    fn open_input(&self, _device: Option<&str>) -> Result<Box<dyn FrameSource>> {
        if let Some(message) = &self.fail_input {
            return Err(RepeaterError::AudioDevice(message.clone()));
        }
        Ok(Box::new(MemorySource {
            frames: self.frames.clone(),
        }))
    }

    fn open_output(&self, _device: Option<&str>) -> Result<Box<dyn FrameSink>> {
        if let Some(message) = &self.fail_output {
            return Err(RepeaterError::AudioDevice(message.clone()));
        }
        Ok(Box::new(MemorySink {
            output: self.output.clone(),
        }))
    }
}

impl MemoryFeed {
    pub fn push(&self, frame: AudioFrame) {
        // Only fails once every source and the backend are gone.
        let _ = self.tx.send(frame);
    }

    /// Push `count` frames of a constant sample value.
    pub fn push_constant(&self, value: i16, count: usize) {
        for _ in 0..count {
            self.push(AudioFrame::new(vec![value; super::FRAME_SAMPLES]));
        }
    }

    /// Frames not yet read by a source.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }

    /// Block until every pushed frame was read or `timeout` passes.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.tx.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl OutputCapture {
    pub fn samples(&self) -> Vec<i16> {
        self.inner.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.0.lock().clear();
    }

    /// Block until at least `len` samples were written or `timeout` passes.
    /// Returns the length seen last.
    pub fn wait_for_len(&self, len: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut samples = lock.lock();
        while samples.len() < len {
            if cvar.wait_until(&mut samples, deadline).timed_out() {
                break;
            }
        }
        samples.len()
    }

    fn extend(&self, data: &[i16]) {
        let (lock, cvar) = &*self.inner;
        lock.lock().extend_from_slice(data);
        cvar.notify_all();
    }
}

struct MemorySource {
    frames: Receiver<AudioFrame>,
}

impl FrameSource for MemorySource {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RepeaterError::DeviceDisconnected(
                "memory input feed closed".into(),
            )),
        }
    }

    fn discard_pending(&mut self) -> usize {
        self.frames.try_iter().map(|f| f.len()).sum()
    }
}

struct MemorySink {
    output: OutputCapture,
}

impl FrameSink for MemorySink {
    fn write(&mut self, samples: &[i16], _timeout: Duration) -> Result<usize> {
        self.output.extend(samples);
        Ok(samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_flow_from_feed_to_source() {
        let (backend, feed, _out) = MemoryBackend::new();
        let mut source = backend.open_input(None).unwrap();
        feed.push_constant(7, 2);
        let frame = source.read_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert!(frame.samples().iter().all(|&s| s == 7));
        assert_eq!(source.discard_pending(), super::super::FRAME_SAMPLES);
        assert!(source.read_frame(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn sink_output_is_collected_in_order() {
        let (backend, _feed, out) = MemoryBackend::new();
        let mut sink = backend.open_output(None).unwrap();
        sink.write(&[1, 2], Duration::ZERO).unwrap();
        sink.write(&[3], Duration::ZERO).unwrap();
        assert_eq!(out.wait_for_len(3, Duration::from_millis(10)), 3);
        assert_eq!(out.samples(), vec![1, 2, 3]);
    }

    #[test]
    fn failing_input_reports_device_error() {
        let (backend, _feed, _out) = MemoryBackend::new();
        let backend = backend.failing_input("busy");
        assert!(matches!(
            backend.open_input(None),
            Err(RepeaterError::AudioDevice(msg)) if msg == "busy"
        ));
    }
}
