//! WAV file input source, for headless runs and reproducible tests.
//!
//! The file must be 16-bit integer mono at 44.1 kHz; nothing is resampled.
//! Frames are released at device pace. After the last sample the source keeps
//! producing silent frames, so a trailing recording still ends on the
//! silence timeout exactly as it would with a live microphone.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader};
use tracing::{debug, info};

use super::{FrameSource, FRAME_PERIOD, FRAME_SAMPLES, SAMPLE_RATE};
use crate::buffering::frame::AudioFrame;
use crate::error::{RepeaterError, Result};

pub struct WavSource {
    path: PathBuf,
    reader: Option<WavReader<BufReader<File>>>,
    realtime: bool,
    next_due: Option<Instant>,
    frames_read: u64,
}

impl WavSource {
    /// Open a file and validate its format. Playback is paced in real time.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = WavReader::open(&path)?;
        let spec = reader.spec();
        if spec.channels != 1
            || spec.sample_rate != SAMPLE_RATE
            || spec.bits_per_sample != 16
            || spec.sample_format != SampleFormat::Int
        {
            return Err(RepeaterError::AudioStream(format!(
                "{}: expected 16-bit mono {SAMPLE_RATE} Hz, got {}-bit {}ch {} Hz {:?}",
                path.display(),
                spec.bits_per_sample,
                spec.channels,
                spec.sample_rate,
                spec.sample_format
            )));
        }
        info!(path = %path.display(), samples = reader.len(), "opened WAV input");
        Ok(Self {
            path,
            reader: Some(reader),
            realtime: true,
            next_due: None,
            frames_read: 0,
        })
    }

    /// Release frames as fast as they are asked for.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` once the file is exhausted and only silence remains.
    pub fn is_finished(&self) -> bool {
        self.reader.is_none()
    }

    fn next_samples(&mut self) -> Result<Vec<i16>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(vec![0; FRAME_SAMPLES]);
        };
        let mut samples = Vec::with_capacity(FRAME_SAMPLES);
        for sample in reader.samples::<i16>().take(FRAME_SAMPLES) {
            samples.push(sample?);
        }
        if samples.len() < FRAME_SAMPLES {
            debug!(path = %self.path.display(), frames = self.frames_read, "WAV input exhausted");
            self.reader = None;
            samples.resize(FRAME_SAMPLES, 0);
        }
        Ok(samples)
    }
}

impl FrameSource for WavSource {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        if self.realtime {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                std::thread::sleep(wait);
            }
            self.next_due = Some(due + FRAME_PERIOD);
        }
        let samples = self.next_samples()?;
        self.frames_read += 1;
        Ok(Some(AudioFrame::new(samples)))
    }
}
