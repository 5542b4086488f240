//! Second-order IIR section (transposed direct form II, f64 state).
//!
//! Coefficients follow the RBJ audio-EQ cookbook bilinear designs. With
//! `Q = 1/√2` a single section is a 2nd-order Butterworth response; cascading
//! a highpass and a lowpass section gives a 4th-order Butterworth band.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Normalised biquad coefficients (`a0 == 1`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefficients {
    /// Pass-through section.
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// 2nd-order Butterworth lowpass.
    pub fn butterworth_lowpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let (cos_w0, alpha) = Self::prewarp(cutoff_hz, sample_rate);
        let b1 = 1.0 - cos_w0;
        Self::normalise(b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    /// 2nd-order Butterworth highpass.
    pub fn butterworth_highpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let (cos_w0, alpha) = Self::prewarp(cutoff_hz, sample_rate);
        let b0 = (1.0 + cos_w0) / 2.0;
        Self::normalise(b0, -(1.0 + cos_w0), b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    fn prewarp(cutoff_hz: f64, sample_rate: f64) -> (f64, f64) {
        // Keep the cutoff strictly inside (0, Nyquist).
        let f = cutoff_hz.clamp(1.0, sample_rate * 0.45);
        let w0 = 2.0 * PI * f / sample_rate;
        let alpha = w0.sin() / (2.0 * FRAC_1_SQRT_2);
        (w0.cos(), alpha)
    }

    fn normalise(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// One biquad with its delay memory.
#[derive(Debug, Clone)]
pub struct Biquad {
    coeffs: BiquadCoefficients,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoefficients) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Swap coefficients, keeping the delay state.
    pub fn set_coefficients(&mut self, coeffs: BiquadCoefficients) {
        self.coeffs = coeffs;
    }

    pub fn coefficients(&self) -> BiquadCoefficients {
        self.coeffs
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let c = &self.coeffs;
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const FS: f64 = 44_100.0;

    /// Magnitude response |H(e^jw)| at `freq`.
    fn magnitude(c: &BiquadCoefficients, freq: f64) -> f64 {
        let w = 2.0 * PI * freq / FS;
        let (cos1, sin1) = (w.cos(), w.sin());
        let (cos2, sin2) = ((2.0 * w).cos(), (2.0 * w).sin());
        let num_re = c.b0 + c.b1 * cos1 + c.b2 * cos2;
        let num_im = -(c.b1 * sin1 + c.b2 * sin2);
        let den_re = 1.0 + c.a1 * cos1 + c.a2 * cos2;
        let den_im = -(c.a1 * sin1 + c.a2 * sin2);
        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }

    #[test]
    fn lowpass_is_minus_3db_at_cutoff() {
        let c = BiquadCoefficients::butterworth_lowpass(1000.0, FS);
        assert_relative_eq!(magnitude(&c, 1000.0), FRAC_1_SQRT_2, max_relative = 1e-3);
        assert_relative_eq!(magnitude(&c, 1.0), 1.0, max_relative = 1e-3);
        assert!(magnitude(&c, 10_000.0) < 0.02);
    }

    #[test]
    fn highpass_is_minus_3db_at_cutoff() {
        let c = BiquadCoefficients::butterworth_highpass(1000.0, FS);
        assert_relative_eq!(magnitude(&c, 1000.0), FRAC_1_SQRT_2, max_relative = 1e-3);
        assert!(magnitude(&c, 100.0) < 0.02);
    }

    #[test]
    fn identity_passes_samples_through() {
        let mut bq = Biquad::new(BiquadCoefficients::IDENTITY);
        for x in [0.0, 1.5, -300.0, 12_000.0] {
            assert_eq!(bq.process(x), x);
        }
    }

    #[test]
    fn reset_clears_ringing() {
        let mut bq = Biquad::new(BiquadCoefficients::butterworth_lowpass(500.0, FS));
        bq.process(10_000.0);
        assert!(bq.process(0.0) != 0.0);
        bq.reset();
        assert_eq!(bq.process(0.0), 0.0);
    }
}
