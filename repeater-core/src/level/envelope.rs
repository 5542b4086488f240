//! Attack/release envelope follower over per-frame mean absolute levels.
//!
//! ## Algorithm
//!
//! 1. `raw = mean(|x|)` over the frame.
//! 2. Pick the attack factor when `raw > level`, the release factor otherwise.
//! 3. `level = alpha * raw + (1 - alpha) * level`
//!
//! with `alpha = 1 - exp(-frame_duration / tau)`. A time of 0 ms gives
//! `tau = 0`, `exp(-inf) = 0` and therefore `alpha = 1`: the level tracks the
//! raw value exactly, with no separate code path.

use super::mean_abs;
use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE};

/// Per-frame blend factor for a time constant in milliseconds.
pub fn smoothing_alpha(time_ms: f32, frame_duration_secs: f64) -> f64 {
    let tau = f64::from(time_ms.max(0.0)) / 1000.0;
    1.0 - (-frame_duration_secs / tau).exp()
}

/// Smoothed level meter with asymmetric attack and release.
#[derive(Debug, Clone)]
pub struct LevelDetector {
    attack_ms: f32,
    release_ms: f32,
    attack_alpha: f64,
    release_alpha: f64,
    frame_duration_secs: f64,
    level: f64,
    raw: f64,
}

impl LevelDetector {
    /// Detector for the fixed device frame size.
    pub fn new(attack_ms: f32, release_ms: f32) -> Self {
        Self::with_frame_duration(
            attack_ms,
            release_ms,
            FRAME_SAMPLES as f64 / SAMPLE_RATE as f64,
        )
    }

    pub fn with_frame_duration(attack_ms: f32, release_ms: f32, frame_duration_secs: f64) -> Self {
        let mut detector = Self {
            attack_ms,
            release_ms,
            attack_alpha: 1.0,
            release_alpha: 1.0,
            frame_duration_secs,
            level: 0.0,
            raw: 0.0,
        };
        detector.set_times(attack_ms, release_ms);
        detector
    }

    /// Update the time constants. The current level is kept.
    pub fn set_times(&mut self, attack_ms: f32, release_ms: f32) {
        self.attack_ms = attack_ms;
        self.release_ms = release_ms;
        self.attack_alpha = smoothing_alpha(attack_ms, self.frame_duration_secs);
        self.release_alpha = smoothing_alpha(release_ms, self.frame_duration_secs);
    }

    /// Feed one frame and return the new smoothed level.
    pub fn update(&mut self, samples: &[i16]) -> f32 {
        let raw = mean_abs(samples);
        let alpha = if raw > self.level {
            self.attack_alpha
        } else {
            self.release_alpha
        };
        let blended = alpha * raw + (1.0 - alpha) * self.level;
        // Rounding must never push the level outside [previous, raw].
        let (lo, hi) = if raw < self.level {
            (raw, self.level)
        } else {
            (self.level, raw)
        };
        self.level = blended.clamp(lo, hi);
        self.raw = raw;
        self.level as f32
    }

    /// Last smoothed level.
    pub fn level(&self) -> f32 {
        self.level as f32
    }

    /// Last unsmoothed mean absolute value.
    pub fn raw_level(&self) -> f32 {
        self.raw as f32
    }

    pub fn times(&self) -> (f32, f32) {
        (self.attack_ms, self.release_ms)
    }

    /// Drop back to silence (e.g. on engine restart).
    pub fn reset(&mut self) {
        self.level = 0.0;
        self.raw = 0.0;
    }
}
