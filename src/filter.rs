//! Butterworth band-pass built from cascaded second-order sections.
//!
//! The band-pass is a low-pass at the upper corner cascaded with a high-pass
//! at the lower corner. Odd orders add one first-order section per corner.

use std::f64::consts::PI;

use crate::band::FrequencyBand;

/// One second-order section, `H(z) = (b0 + b1 z^-1 + b2 z^-2) / (1 + a1 z^-1 + a2 z^-2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
}

impl Biquad {
    pub fn new(b: [f64; 3], a: [f64; 2]) -> Self {
        Self { b, a }
    }

    fn normalized(b: [f64; 3], a0: f64, a: [f64; 2]) -> Self {
        Self::new(
            [b[0] / a0, b[1] / a0, b[2] / a0],
            [a[0] / a0, a[1] / a0],
        )
    }

    pub fn lowpass(cutoff_hz: f64, sample_rate: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        let k = (1.0 - cos) / 2.0;
        Self::normalized([k, 1.0 - cos, k], 1.0 + alpha, [-2.0 * cos, 1.0 - alpha])
    }

    pub fn highpass(cutoff_hz: f64, sample_rate: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        let k = (1.0 + cos) / 2.0;
        Self::normalized([k, -(1.0 + cos), k], 1.0 + alpha, [-2.0 * cos, 1.0 - alpha])
    }

    pub fn first_order_lowpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let k = (PI * cutoff_hz / sample_rate).tan();
        let norm = 1.0 + k;
        Self::new([k / norm, k / norm, 0.0], [(k - 1.0) / norm, 0.0])
    }

    pub fn first_order_highpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let k = (PI * cutoff_hz / sample_rate).tan();
        let norm = 1.0 + k;
        Self::new([1.0 / norm, -1.0 / norm, 0.0], [(k - 1.0) / norm, 0.0])
    }

    /// Filter in place (Direct Form II Transposed), starting from rest.
    pub fn process(&self, signal: &mut [f64]) {
        let mut s0 = 0.0;
        let mut s1 = 0.0;
        for x in signal.iter_mut() {
            let input = *x;
            let output = self.b[0] * input + s0;
            s0 = self.b[1] * input - self.a[0] * output + s1;
            s1 = self.b[2] * input - self.a[1] * output;
            *x = output;
        }
    }

    pub fn is_stable(&self) -> bool {
        self.a[1].abs() < 1.0 && self.a[0].abs() < 1.0 + self.a[1]
    }
}

/// Q of each conjugate pole pair of an analog Butterworth prototype.
fn butterworth_q(order: usize) -> Vec<f64> {
    (0..order / 2)
        .map(|k| {
            let theta = PI * (2 * k + 1) as f64 / (2 * order) as f64;
            1.0 / (2.0 * theta.cos())
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BandPass {
    sections: Vec<Biquad>,
}

impl BandPass {
    /// Butterworth band-pass with `order` poles per corner.
    ///
    /// Returns `None` when the band does not fit below Nyquist.
    pub fn butterworth(order: usize, band: &FrequencyBand, sample_rate: f64) -> Option<Self> {
        let nyquist = sample_rate / 2.0;
        if order == 0 || band.low <= 0.0 || band.high <= band.low || band.high >= nyquist {
            return None;
        }

        let qs = butterworth_q(order);
        let mut sections = Vec::with_capacity(order + 1);
        for &q in &qs {
            sections.push(Biquad::lowpass(band.high, sample_rate, q));
        }
        if order % 2 == 1 {
            sections.push(Biquad::first_order_lowpass(band.high, sample_rate));
        }
        for &q in &qs {
            sections.push(Biquad::highpass(band.low, sample_rate, q));
        }
        if order % 2 == 1 {
            sections.push(Biquad::first_order_highpass(band.low, sample_rate));
        }
        Some(Self { sections })
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    pub fn apply(&self, signal: &mut [f64]) {
        for section in &self.sections {
            section.process(signal);
        }
    }

    /// Forward-backward filtering: zero phase, squared magnitude response.
    pub fn apply_zero_phase(&self, signal: &mut [f64]) {
        self.apply(signal);
        signal.reverse();
        self.apply(signal);
        signal.reverse();
    }
}
