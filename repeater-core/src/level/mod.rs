//! Signal level measurement.
//!
//! The raw level of a frame is its mean absolute sample value, in `i16`
//! sample units (0–32768). [`LevelDetector`] smooths that value over time with
//! separate attack and release constants; the engines compare the smoothed
//! level against the configured start/stop thresholds.

pub mod envelope;

pub use envelope::{smoothing_alpha, LevelDetector};

/// Where a level sits relative to the start/stop thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdZone {
    /// `level >= start_threshold`.
    Trigger,
    /// Between the two thresholds.
    Hold,
    /// `level <= stop_threshold`.
    Quiet,
}

impl ThresholdZone {
    pub fn classify(level: f32, start_threshold: f32, stop_threshold: f32) -> Self {
        if level >= start_threshold {
            ThresholdZone::Trigger
        } else if level <= stop_threshold {
            ThresholdZone::Quiet
        } else {
            ThresholdZone::Hold
        }
    }
}

/// Mean absolute value of a sample slice. Zero for an empty slice.
pub fn mean_abs(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|s| s.unsigned_abs() as u64).sum();
    sum as f64 / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_abs_handles_negative_extremes() {
        assert_eq!(mean_abs(&[i16::MIN, i16::MIN]), 32768.0);
        assert_eq!(mean_abs(&[100, -300]), 200.0);
    }

    #[test]
    fn mean_abs_of_empty_is_zero() {
        assert_eq!(mean_abs(&[]), 0.0);
    }

    #[test]
    fn classify_uses_inclusive_bounds() {
        assert_eq!(ThresholdZone::classify(2000.0, 2000.0, 500.0), ThresholdZone::Trigger);
        assert_eq!(ThresholdZone::classify(500.0, 2000.0, 500.0), ThresholdZone::Quiet);
        assert_eq!(ThresholdZone::classify(1000.0, 2000.0, 500.0), ThresholdZone::Hold);
    }

    #[test]
    fn equal_thresholds_prefer_trigger() {
        assert_eq!(ThresholdZone::classify(700.0, 700.0, 700.0), ThresholdZone::Trigger);
    }
}
