//! Speaker output via cpal.
//!
//! The output callback pops mono `i16` samples from an SPSC ring and copies
//! each one to every device channel. An empty ring produces silence, so the
//! stream stays open and quiet while the engine is not playing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange,
};
use tracing::{error, info};

use super::device::{select_device, DeviceDirection};
use super::{i16_to_f32, FrameSink, StreamFault, RING_POLL_INTERVAL, SAMPLE_RATE};
use crate::buffering::{create_sample_ring, Consumer, Producer, SampleProducer, OUTPUT_RING_CAPACITY};
use crate::error::{RepeaterError, Result};

/// Handle to an open output stream. **Not `Send`**, see [`super::capture::CpalInput`].
pub struct CpalOutput {
    _stream: Stream,
    producer: SampleProducer,
    fault: Arc<StreamFault>,
    device_name: String,
}

fn negotiate(ranges: &[SupportedStreamConfigRange]) -> Option<(u16, SampleFormat)> {
    ranges
        .iter()
        .filter(|r| r.min_sample_rate().0 <= SAMPLE_RATE && r.max_sample_rate().0 >= SAMPLE_RATE)
        .filter(|r| matches!(r.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .min_by_key(|r| (r.channels() != 1, r.sample_format() != SampleFormat::I16, r.channels()))
        .map(|r| (r.channels(), r.sample_format()))
}

impl CpalOutput {
    pub fn open(preferred: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, DeviceDirection::Output, preferred)?;
        let device_name = device.name().unwrap_or_default();

        info!(device = device_name.as_str(), "opening output device");

        let ranges: Vec<SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| RepeaterError::AudioDevice(e.to_string()))?
            .collect();
        let (channels, format) = negotiate(&ranges).ok_or_else(|| {
            RepeaterError::AudioDevice(format!(
                "'{device_name}' has no {SAMPLE_RATE} Hz i16/f32 output configuration"
            ))
        })?;

        info!(sample_rate = SAMPLE_RATE, channels, ?format, "output config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, mut consumer) = create_sample_ring(OUTPUT_RING_CAPACITY);
        let fault = Arc::new(StreamFault::default());
        let ch = usize::from(channels.max(1));

        let err_fault = Arc::clone(&fault);
        let on_error = move |err: cpal::StreamError| {
            error!("output stream error: {err}");
            err_fault.raise(err.to_string());
        };

        let stream = match format {
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    for frame in data.chunks_exact_mut(ch) {
                        let sample = consumer.try_pop().unwrap_or(0);
                        frame.fill(sample);
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    for frame in data.chunks_exact_mut(ch) {
                        let sample = i16_to_f32(consumer.try_pop().unwrap_or(0));
                        frame.fill(sample);
                    }
                },
                on_error,
                None,
            ),
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
            producer,
            fault,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl FrameSink for CpalOutput {
    fn write(&mut self, samples: &[i16], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        loop {
            self.fault.check()?;
            written += self.producer.push_slice(&samples[written..]);
            if written == samples.len() || Instant::now() >= deadline {
                return Ok(written);
            }
            std::thread::sleep(RING_POLL_INTERVAL);
        }
    }
}
