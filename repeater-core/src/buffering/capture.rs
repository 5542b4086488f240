//! In-memory capture buffer for one recording session.

use crate::audio::SAMPLE_RATE;

use super::frame::AudioFrame;

/// Append-only sample accumulator with a hard length cap.
///
/// Created when a recording starts and consumed by playback (simplex) or by
/// the duplex queue. Nothing here ever touches storage.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    id: u64,
    samples: Vec<i16>,
    max_samples: usize,
}

impl CaptureBuffer {
    /// `max_samples` is the inclusive length cap (`max_record_seconds * SAMPLE_RATE`).
    pub fn new(id: u64, max_samples: usize) -> Self {
        Self {
            id,
            // Reserve up to ~10 s; long caps grow on demand.
            samples: Vec::with_capacity(max_samples.min(SAMPLE_RATE as usize * 10)),
            max_samples,
        }
    }

    /// Build a finished buffer directly from samples (used by tests and file sources).
    pub fn from_samples(id: u64, samples: Vec<i16>) -> Self {
        let max_samples = samples.len();
        Self {
            id,
            samples,
            max_samples,
        }
    }

    /// Append a frame, truncating it at the cap. Returns how many samples were taken.
    pub fn push_frame(&mut self, frame: &AudioFrame) -> usize {
        let room = self.remaining();
        let take = frame.len().min(room);
        self.samples.extend_from_slice(&frame.samples()[..take]);
        take
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn remaining(&self) -> usize {
        self.max_samples.saturating_sub(self.samples.len())
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.max_samples
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Fill level in percent of the cap, for progress display.
    pub fn fill_percent(&self) -> f32 {
        if self.max_samples == 0 {
            return 100.0;
        }
        (self.samples.len() as f64 / self.max_samples as f64 * 100.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; FRAME_SAMPLES])
    }

    #[test]
    fn preserves_frame_order() {
        let mut buf = CaptureBuffer::new(0, FRAME_SAMPLES * 4);
        buf.push_frame(&frame(1));
        buf.push_frame(&frame(2));
        assert_eq!(buf.samples()[0], 1);
        assert_eq!(buf.samples()[FRAME_SAMPLES], 2);
        assert_eq!(buf.len(), FRAME_SAMPLES * 2);
    }

    #[test]
    fn truncates_at_cap() {
        let cap = FRAME_SAMPLES + 100;
        let mut buf = CaptureBuffer::new(0, cap);
        assert_eq!(buf.push_frame(&frame(1)), FRAME_SAMPLES);
        assert_eq!(buf.push_frame(&frame(2)), 100);
        assert!(buf.is_full());
        assert_eq!(buf.push_frame(&frame(3)), 0);
        assert_eq!(buf.len(), cap);
    }

    #[test]
    fn fill_percent_tracks_cap() {
        let mut buf = CaptureBuffer::new(0, FRAME_SAMPLES * 4);
        buf.push_frame(&frame(1));
        assert!((buf.fill_percent() - 25.0).abs() < 1e-4);
    }
}
