//! Five-band graphic equalizer for the playback path.
//!
//! ## Structure
//!
//! Each band is a 4th-order Butterworth bandpass: a 2nd-order highpass at the
//! lower band edge cascaded with a 2nd-order lowpass at the upper edge. Edges
//! sit at the geometric mean between neighbouring centres, so the bands tile
//! the spectrum:
//!
//! ```text
//! band   centre    lower edge   upper edge
//!  1       60 Hz      20 Hz       117 Hz   (highpass only trims sub-audio)
//!  2      230 Hz     117 Hz       457 Hz
//!  3      910 Hz     457 Hz      1810 Hz
//!  4     3600 Hz    1810 Hz      7099 Hz
//!  5    14000 Hz    7099 Hz     20000 Hz   (lowpass only trims the top)
//! ```
//!
//! The output is the dry signal plus each band scaled by `(g - 1)`, where
//! `g = 10^(gain_db / 20)`. This is the "band sum added to a neutral pass"
//! form: at 0 dB every band contributes nothing and the result is exactly the
//! input. When all gains are 0 dB the `bypass` flag short-circuits `apply` to
//! a copy, so the realtime duplex path pays nothing for an idle equalizer.

use super::biquad::{Biquad, BiquadCoefficients};
use super::{db_to_linear, to_i16};
use crate::audio::SAMPLE_RATE;

pub const BAND_COUNT: usize = 5;

/// Fixed band centre frequencies in Hz.
pub const BAND_CENTERS_HZ: [f64; BAND_COUNT] = [60.0, 230.0, 910.0, 3600.0, 14_000.0];

pub const MIN_GAIN_DB: f32 = -12.0;
pub const MAX_GAIN_DB: f32 = 12.0;

const LOWEST_EDGE_HZ: f64 = 20.0;
const HIGHEST_EDGE_HZ: f64 = 20_000.0;

/// Lower and upper -3 dB edges of band `index`.
pub fn band_edges(index: usize) -> (f64, f64) {
    let lower = if index == 0 {
        LOWEST_EDGE_HZ
    } else {
        (BAND_CENTERS_HZ[index - 1] * BAND_CENTERS_HZ[index]).sqrt()
    };
    let upper = if index + 1 == BAND_COUNT {
        HIGHEST_EDGE_HZ
    } else {
        (BAND_CENTERS_HZ[index] * BAND_CENTERS_HZ[index + 1]).sqrt()
    };
    (lower, upper)
}

#[derive(Debug, Clone)]
struct Band {
    gain_db: f32,
    /// `10^(gain_db/20) - 1`, the amount of filtered signal added to the dry path.
    mix: f64,
    highpass: Biquad,
    lowpass: Biquad,
}

impl Band {
    fn new(index: usize, sample_rate: f64) -> Self {
        let mut band = Self {
            gain_db: 0.0,
            mix: 0.0,
            highpass: Biquad::new(BiquadCoefficients::IDENTITY),
            lowpass: Biquad::new(BiquadCoefficients::IDENTITY),
        };
        band.design(index, sample_rate);
        band
    }

    fn design(&mut self, index: usize, sample_rate: f64) {
        let (lower, upper) = band_edges(index);
        self.highpass
            .set_coefficients(BiquadCoefficients::butterworth_highpass(lower, sample_rate));
        self.lowpass
            .set_coefficients(BiquadCoefficients::butterworth_lowpass(upper, sample_rate));
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        self.lowpass.process(self.highpass.process(x))
    }

    fn reset(&mut self) {
        self.highpass.reset();
        self.lowpass.reset();
    }
}

/// Stateful five-band equalizer.
///
/// Filter memory carries over between `apply` calls so a buffer streamed
/// frame-by-frame sounds the same as one processed whole. Call [`reset`]
/// before starting an unrelated recording.
///
/// [`reset`]: Equalizer::reset
#[derive(Debug, Clone)]
pub struct Equalizer {
    sample_rate: u32,
    bands: [Band; BAND_COUNT],
    bypass: bool,
}

impl Equalizer {
    pub fn new(sample_rate: u32) -> Self {
        let fs = f64::from(sample_rate);
        Self {
            sample_rate,
            bands: std::array::from_fn(|i| Band::new(i, fs)),
            bypass: true,
        }
    }

    /// Set one band's gain, clamped to ±12 dB. Out-of-range indices are ignored.
    pub fn set_gain(&mut self, band: usize, gain_db: f32) {
        let Some(slot) = self.bands.get_mut(band) else {
            return;
        };
        let gain_db = if gain_db.is_finite() {
            gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB)
        } else {
            0.0
        };
        if slot.gain_db == gain_db {
            return;
        }
        slot.gain_db = gain_db;
        slot.mix = db_to_linear(gain_db) - 1.0;
        self.bypass = self.bands.iter().all(|b| b.gain_db == 0.0);
    }

    /// Set all gains at once. Unchanged bands cost nothing.
    pub fn set_gains(&mut self, gains_db: &[f32; BAND_COUNT]) {
        for (band, gain) in gains_db.iter().enumerate() {
            self.set_gain(band, *gain);
        }
    }

    pub fn gains(&self) -> [f32; BAND_COUNT] {
        std::array::from_fn(|i| self.bands[i].gain_db)
    }

    /// `true` when every band is at 0 dB and `apply` is a plain copy.
    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Redesign all filters for a new rate. Clears filter memory.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        let fs = f64::from(sample_rate);
        for (i, band) in self.bands.iter_mut().enumerate() {
            band.design(i, fs);
            band.reset();
        }
    }

    /// Clear filter memory so a new playback starts from silence.
    pub fn reset(&mut self) {
        for band in &mut self.bands {
            band.reset();
        }
    }

    /// Filter a block of samples into a new vector.
    pub fn apply(&mut self, samples: &[i16]) -> Vec<i16> {
        let mut out = samples.to_vec();
        self.apply_in_place(&mut out);
        out
    }

    /// Filter a block of samples in place.
    pub fn apply_in_place(&mut self, samples: &mut [i16]) {
        if self.bypass {
            return;
        }
        for sample in samples.iter_mut() {
            let x = f64::from(*sample);
            let mut y = x;
            for band in &mut self.bands {
                let filtered = band.process(x);
                y += band.mix * filtered;
            }
            *sample = to_i16(y);
        }
    }
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    /// Deterministic pseudo-random samples covering the full i16 range.
    fn noise(len: usize, seed: u32) -> Vec<i16> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 16) as u16 as i16
            })
            .collect()
    }

    fn sine(freq: f64, amplitude: f64, len: usize) -> Vec<i16> {
        (0..len)
            .map(|n| (amplitude * (2.0 * PI * freq * n as f64 / 44_100.0).sin()).round() as i16)
            .collect()
    }

    fn rms(samples: &[i16]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// RMS gain over the second half, after the filters have settled.
    fn settled_gain(eq: &mut Equalizer, input: &[i16]) -> f64 {
        let out = eq.apply(input);
        let half = input.len() / 2;
        rms(&out[half..]) / rms(&input[half..])
    }

    #[test]
    fn flat_equalizer_is_identity_for_any_length() {
        let mut eq = Equalizer::default();
        assert!(eq.is_bypassed());
        for len in [0usize, 1, 2, 1023, 1024, 1025, 9000] {
            let input = noise(len, len as u32 + 7);
            assert_eq!(eq.apply(&input), input, "len={len}");
        }
    }

    #[test]
    fn returning_all_gains_to_zero_restores_bypass() {
        let mut eq = Equalizer::default();
        eq.set_gain(2, 6.0);
        assert!(!eq.is_bypassed());
        eq.set_gain(2, 0.0);
        assert!(eq.is_bypassed());
        let input = noise(2048, 3);
        assert_eq!(eq.apply(&input), input);
    }

    #[test]
    fn boost_raises_level_inside_band() {
        let mut eq = Equalizer::default();
        eq.set_gain(2, 6.0);
        let gain = settled_gain(&mut eq, &sine(910.0, 8000.0, 44_100));
        assert!(gain > 1.5, "gain={gain}");
    }

    #[test]
    fn cut_lowers_level_inside_band() {
        let mut eq = Equalizer::default();
        eq.set_gain(2, -12.0);
        let gain = settled_gain(&mut eq, &sine(910.0, 8000.0, 44_100));
        assert!(gain < 0.5, "gain={gain}");
    }

    #[test]
    fn boost_leaves_distant_band_alone() {
        let mut eq = Equalizer::default();
        eq.set_gain(4, 12.0);
        let gain = settled_gain(&mut eq, &sine(60.0, 8000.0, 44_100));
        assert!((gain - 1.0).abs() < 0.02, "gain={gain}");
    }

    #[test]
    fn gains_are_clamped() {
        let mut eq = Equalizer::default();
        eq.set_gain(0, 40.0);
        eq.set_gain(1, -40.0);
        eq.set_gain(2, f32::NAN);
        assert_eq!(eq.gains(), [12.0, -12.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn output_saturates_instead_of_wrapping() {
        let mut eq = Equalizer::default();
        eq.set_gains(&[12.0; BAND_COUNT]);
        let out = eq.apply(&sine(910.0, 30_000.0, 8192));
        assert!(out.iter().any(|&s| s == i16::MAX));
        assert!(out.iter().any(|&s| s == i16::MIN));
    }

    #[test]
    fn frame_by_frame_matches_whole_buffer() {
        let input = noise(4096, 11);
        let mut whole = Equalizer::default();
        whole.set_gain(1, 9.0);
        let expected = whole.apply(&input);

        let mut streamed = Equalizer::default();
        streamed.set_gain(1, 9.0);
        let mut got = Vec::new();
        for chunk in input.chunks(1024) {
            got.extend(streamed.apply(chunk));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn reset_forgets_previous_stream() {
        let input = noise(2048, 5);
        let mut eq = Equalizer::default();
        eq.set_gain(0, 12.0);
        let fresh = eq.apply(&input);
        eq.apply(&noise(2048, 99));
        eq.reset();
        assert_eq!(eq.apply(&input), fresh);
    }

    #[test]
    fn band_edges_tile_the_spectrum() {
        for i in 1..BAND_COUNT {
            assert_eq!(band_edges(i - 1).1, band_edges(i).0);
        }
        assert_eq!(band_edges(0).0, 20.0);
        assert_eq!(band_edges(4).1, 20_000.0);
    }
}
