//! Frequency bands
//!
//! A band is the unit of independence: nothing but configuration is shared
//! between the inversions of two bands.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Pass band of one inversion, corners in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    /// Lower corner [Hz]
    pub low: f64,
    /// Upper corner [Hz]
    pub high: f64,
}

impl FrequencyBand {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Octave band centred (geometrically) on `center`.
    pub fn octave(center: f64) -> Self {
        let half = std::f64::consts::SQRT_2;
        Self::new(center / half, center * half)
    }

    /// Geometric centre frequency, used for Q conversions.
    pub fn center(&self) -> f64 {
        (self.low * self.high).sqrt()
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.low.is_finite() || !self.high.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "band {self} must have finite corners"
            )));
        }
        if self.low <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "band {self} must have a positive lower corner"
            )));
        }
        if self.high <= self.low {
            return Err(Error::InvalidConfig(format!(
                "band {self} upper corner must exceed the lower corner"
            )));
        }
        Ok(())
    }

    pub(crate) fn key(&self) -> (u64, u64) {
        (self.low.to_bits(), self.high.to_bits())
    }
}

impl fmt::Display for FrequencyBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}-{:.3} Hz", self.low, self.high)
    }
}
