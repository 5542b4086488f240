//! Microphone input via cpal.
//!
//! The input callback downmixes whatever channel layout the device offers to
//! mono `i16` and pushes it into an SPSC ring. [`CpalInput::read_frame`] runs on
//! the engine loop thread and cuts the ring contents into 1024-sample frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange,
};
use tracing::{error, info, warn};

use super::device::{is_loopback_like_name, select_device, DeviceDirection};
use super::{f32_to_i16, FrameSource, StreamFault, FRAME_SAMPLES, RING_POLL_INTERVAL, SAMPLE_RATE};
use crate::buffering::{
    create_sample_ring, frame::AudioFrame, Consumer, Producer, SampleConsumer, INPUT_RING_CAPACITY,
};
use crate::error::{RepeaterError, Result};

/// Handle to an open input stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Open and drop it on the engine loop thread.
pub struct CpalInput {
    _stream: Stream,
    consumer: SampleConsumer,
    pending: Vec<i16>,
    fault: Arc<StreamFault>,
    device_name: String,
}

/// Pick a 44.1 kHz capable configuration, preferring mono and then `i16`.
fn negotiate(ranges: &[SupportedStreamConfigRange]) -> Option<(u16, SampleFormat)> {
    ranges
        .iter()
        .filter(|r| r.min_sample_rate().0 <= SAMPLE_RATE && r.max_sample_rate().0 >= SAMPLE_RATE)
        .filter(|r| matches!(r.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .min_by_key(|r| (r.channels() != 1, r.sample_format() != SampleFormat::I16, r.channels()))
        .map(|r| (r.channels(), r.sample_format()))
}

impl CpalInput {
    /// Open an input device by preferred name, otherwise the default input and
    /// then the first available one.
    pub fn open(preferred: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, DeviceDirection::Input, preferred)?;
        let device_name = device.name().unwrap_or_default();

        info!(device = device_name.as_str(), "opening input device");
        if is_loopback_like_name(&device_name) {
            warn!(
                device = device_name.as_str(),
                "input looks like a loopback device; playback will re-trigger recording"
            );
        }

        let ranges: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| RepeaterError::AudioDevice(e.to_string()))?
            .collect();
        let (channels, format) = negotiate(&ranges).ok_or_else(|| {
            RepeaterError::AudioDevice(format!(
                "'{device_name}' has no {SAMPLE_RATE} Hz i16/f32 input configuration"
            ))
        })?;

        info!(sample_rate = SAMPLE_RATE, channels, ?format, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let (mut producer, consumer) = create_sample_ring(INPUT_RING_CAPACITY);
        let fault = Arc::new(StreamFault::default());
        let ch = usize::from(channels.max(1));

        let err_fault = Arc::clone(&fault);
        let on_error = move |err: cpal::StreamError| {
            error!("input stream error: {err}");
            err_fault.raise(err.to_string());
        };

        let stream = match format {
            SampleFormat::I16 => {
                let mut mix_buf: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        let written = if ch == 1 {
                            producer.push_slice(data)
                        } else {
                            mix_buf.clear();
                            mix_buf.extend(data.chunks_exact(ch).map(|f| {
                                let sum: i32 = f.iter().map(|&s| i32::from(s)).sum();
                                (sum / ch as i32) as i16
                            }));
                            producer.push_slice(&mix_buf)
                        };
                        let expected = data.len() / ch;
                        if written < expected {
                            warn!("input ring full: dropped {} samples", expected - written);
                        }
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::F32 => {
                let mut mix_buf: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        mix_buf.clear();
                        mix_buf.extend(
                            data.chunks_exact(ch)
                                .map(|f| f32_to_i16(f.iter().sum::<f32>() / ch as f32)),
                        );
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!("input ring full: dropped {} samples", mix_buf.len() - written);
                        }
                    },
                    on_error,
                    None,
                )
            }
            fmt => {
                return Err(RepeaterError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| RepeaterError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| RepeaterError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
            pending: Vec::with_capacity(FRAME_SAMPLES),
            fault,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl FrameSource for CpalInput {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        let deadline = Instant::now() + timeout;
        let mut scratch = [0i16; FRAME_SAMPLES];
        loop {
            self.fault.check()?;

            let want = FRAME_SAMPLES - self.pending.len();
            let got = self.consumer.pop_slice(&mut scratch[..want]);
            self.pending.extend_from_slice(&scratch[..got]);

            if self.pending.len() == FRAME_SAMPLES {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(FRAME_SAMPLES));
                return Ok(Some(AudioFrame::new(samples)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(RING_POLL_INTERVAL);
        }
    }

    fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len() + self.consumer.clear();
        self.pending.clear();
        dropped
    }
}
