//! Playback-path signal processing: equalizer and output gain.

pub mod biquad;
pub mod equalizer;

pub use equalizer::{Equalizer, BAND_CENTERS_HZ, BAND_COUNT};

/// Decibels to a linear amplitude factor.
pub fn db_to_linear(db: f32) -> f64 {
    10f64.powf(f64::from(db) / 20.0)
}

/// Round and saturate a processed sample back to `i16`.
#[inline]
pub fn to_i16(x: f64) -> i16 {
    x.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Apply a flat output gain in place. 0 dB leaves the samples untouched.
pub fn apply_gain_db(samples: &mut [i16], gain_db: f32) {
    if gain_db == 0.0 || !gain_db.is_finite() {
        return;
    }
    let factor = db_to_linear(gain_db);
    for sample in samples.iter_mut() {
        *sample = to_i16(f64::from(*sample) * factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_db_gain_is_untouched() {
        let mut samples = vec![1, -2, 32767, -32768];
        apply_gain_db(&mut samples, 0.0);
        assert_eq!(samples, vec![1, -2, 32767, -32768]);
    }

    #[test]
    fn six_db_roughly_doubles() {
        let mut samples = vec![1000, -1000];
        apply_gain_db(&mut samples, 6.0);
        assert_eq!(samples, vec![1995, -1995]);
    }

    #[test]
    fn gain_saturates() {
        let mut samples = vec![20_000, -20_000];
        apply_gain_db(&mut samples, 12.0);
        assert_eq!(samples, vec![i16::MAX, i16::MIN]);
    }
}
