//! Threshold-gated recording, shared by the simplex loop and the duplex
//! capture loop.
//!
//! A recording opens on the first frame whose smoothed level reaches the
//! start threshold; that frame seeds the buffer. It closes when the buffer
//! hits the length cap, or when the level has stayed at or below the stop
//! threshold for the silence timeout. Silence is counted in samples, so the
//! timeout is exact to the frame that crosses it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::EngineConfig;
use crate::buffering::{capture::CaptureBuffer, frame::AudioFrame};
use crate::level::{LevelDetector, ThresholdZone};

/// Why a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Silence,
    MaxDuration,
}

/// Outcome of feeding one frame to the gate.
#[derive(Debug)]
pub enum GateStep {
    /// Not recording and the level stayed below the start threshold.
    Waiting,
    /// A new recording opened with this frame.
    Started { id: u64 },
    /// The frame was appended to the open recording.
    Recording,
    /// The recording closed; the frame that closed it is included.
    Completed {
        buffer: CaptureBuffer,
        reason: StopReason,
    },
}

#[derive(Debug)]
pub struct RecordGate {
    detector: LevelDetector,
    buffer: Option<CaptureBuffer>,
    quiet_samples: usize,
    next_id: u64,
}

impl RecordGate {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            detector: LevelDetector::new(config.attack_ms, config.release_ms),
            buffer: None,
            quiet_samples: 0,
            next_id: 1,
        }
    }

    /// Pick up changed attack/release times. Thresholds and timeouts are read
    /// from `config` on every frame.
    pub fn apply_config(&mut self, config: &EngineConfig) {
        if self.detector.times() != (config.attack_ms, config.release_ms) {
            self.detector.set_times(config.attack_ms, config.release_ms);
        }
    }

    /// Update the level meter without any gating (dead time).
    pub fn meter(&mut self, frame: &AudioFrame) -> f32 {
        self.detector.update(frame.samples())
    }

    pub fn process(&mut self, frame: &AudioFrame, config: &EngineConfig) -> GateStep {
        let level = self.detector.update(frame.samples());
        let zone = ThresholdZone::classify(level, config.start_threshold, config.stop_threshold);

        let Some(buffer) = self.buffer.as_mut() else {
            if zone != ThresholdZone::Trigger {
                return GateStep::Waiting;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut buffer = CaptureBuffer::new(id, config.max_record_samples());
            buffer.push_frame(frame);
            self.quiet_samples = 0;
            debug!(id, level, "recording started");
            if buffer.is_full() {
                return GateStep::Completed {
                    buffer,
                    reason: StopReason::MaxDuration,
                };
            }
            self.buffer = Some(buffer);
            return GateStep::Started { id };
        };

        buffer.push_frame(frame);
        // Judged against stop alone so equal thresholds still time out.
        if level <= config.stop_threshold {
            self.quiet_samples += frame.len();
        } else {
            self.quiet_samples = 0;
        }

        let reason = if buffer.is_full() {
            StopReason::MaxDuration
        } else if self.quiet_samples >= config.silence_timeout_samples() {
            StopReason::Silence
        } else {
            return GateStep::Recording;
        };

        self.quiet_samples = 0;
        match self.buffer.take() {
            Some(buffer) => {
                debug!(id = buffer.id(), samples = buffer.len(), ?reason, "recording complete");
                GateStep::Completed { buffer, reason }
            }
            None => GateStep::Waiting,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.buffer.is_some()
    }

    /// Drop the open recording, if any. Returns its id.
    pub fn abandon(&mut self) -> Option<u64> {
        self.quiet_samples = 0;
        self.buffer.take().map(|b| b.id())
    }

    /// Fill of the open recording against its cap, in percent.
    pub fn progress(&self) -> Option<f32> {
        self.buffer.as_ref().map(CaptureBuffer::fill_percent)
    }

    pub fn level(&self) -> f32 {
        self.detector.level()
    }

    pub fn raw_level(&self) -> f32 {
        self.detector.raw_level()
    }

    /// Abandon any recording and drop the meter back to silence.
    pub fn reset(&mut self) {
        self.abandon();
        self.detector.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;

    fn config() -> EngineConfig {
        EngineConfig {
            start_threshold: 2000.0,
            stop_threshold: 500.0,
            attack_ms: 0.0,
            release_ms: 0.0,
            max_record_seconds: 1.0,
            silence_timeout_seconds: 0.1,
            ..EngineConfig::default()
        }
    }

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; FRAME_SAMPLES])
    }

    #[test]
    fn trigger_frame_seeds_the_buffer() {
        let cfg = config();
        let mut gate = RecordGate::new(&cfg);
        assert!(matches!(gate.process(&frame(100), &cfg), GateStep::Waiting));
        assert!(matches!(gate.process(&frame(2000), &cfg), GateStep::Started { id: 1 }));
        assert!(gate.is_recording());
    }

    #[test]
    fn silence_timeout_closes_recording() {
        let cfg = config();
        let mut gate = RecordGate::new(&cfg);
        gate.process(&frame(3000), &cfg);
        // 0.1 s = 4410 samples: five quiet frames (5120) are needed, four are not.
        for _ in 0..4 {
            assert!(matches!(gate.process(&frame(100), &cfg), GateStep::Recording));
        }
        match gate.process(&frame(100), &cfg) {
            GateStep::Completed { buffer, reason } => {
                assert_eq!(reason, StopReason::Silence);
                assert_eq!(buffer.len(), 6 * FRAME_SAMPLES);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!gate.is_recording());
    }

    #[test]
    fn loud_frame_resets_the_silence_count() {
        let cfg = config();
        let mut gate = RecordGate::new(&cfg);
        gate.process(&frame(3000), &cfg);
        for _ in 0..4 {
            gate.process(&frame(100), &cfg);
        }
        gate.process(&frame(1000), &cfg);
        for _ in 0..4 {
            assert!(matches!(gate.process(&frame(100), &cfg), GateStep::Recording));
        }
    }

    #[test]
    fn level_equal_to_stop_threshold_counts_as_quiet() {
        let cfg = config();
        let mut gate = RecordGate::new(&cfg);
        gate.process(&frame(3000), &cfg);
        let steps: Vec<_> = (0..5).map(|_| gate.process(&frame(500), &cfg)).collect();
        assert!(matches!(steps.last(), Some(GateStep::Completed { .. })));
    }

    #[test]
    fn equal_thresholds_still_time_out_on_silence() {
        let cfg = EngineConfig {
            start_threshold: 500.0,
            stop_threshold: 500.0,
            ..config()
        };
        let mut gate = RecordGate::new(&cfg);
        assert!(matches!(gate.process(&frame(3000), &cfg), GateStep::Started { id: 1 }));
        for _ in 0..4 {
            assert!(matches!(gate.process(&frame(500), &cfg), GateStep::Recording));
        }
        match gate.process(&frame(500), &cfg) {
            GateStep::Completed { buffer, reason } => {
                assert_eq!(reason, StopReason::Silence);
                assert_eq!(buffer.len(), 6 * FRAME_SAMPLES);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn equal_thresholds_trigger_from_listening() {
        let cfg = EngineConfig {
            start_threshold: 500.0,
            stop_threshold: 500.0,
            ..config()
        };
        let mut gate = RecordGate::new(&cfg);
        assert!(matches!(gate.process(&frame(499), &cfg), GateStep::Waiting));
        assert!(matches!(gate.process(&frame(500), &cfg), GateStep::Started { id: 1 }));
    }

    #[test]
    fn buffer_never_exceeds_cap() {
        let cfg = config();
        let mut gate = RecordGate::new(&cfg);
        let cap = cfg.max_record_samples();
        let mut completed = None;
        for _ in 0..100 {
            if let GateStep::Completed { buffer, reason } = gate.process(&frame(5000), &cfg) {
                completed = Some((buffer, reason));
                break;
            }
        }
        let (buffer, reason) = completed.expect("recording should hit the cap");
        assert_eq!(reason, StopReason::MaxDuration);
        assert_eq!(buffer.len(), cap);
    }

    #[test]
    fn ids_increase_per_recording() {
        let cfg = config();
        let mut gate = RecordGate::new(&cfg);
        gate.process(&frame(3000), &cfg);
        assert_eq!(gate.abandon(), Some(1));
        assert!(matches!(gate.process(&frame(3000), &cfg), GateStep::Started { id: 2 }));
    }
}
