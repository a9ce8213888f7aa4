//! Model parameters
//!
//! Per-event parameters of the energy transport model and the per-station
//! site table shared by all events of one band.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::config::SiteNormalization;
use crate::stats;

/// Whether a model parameter is estimated or held at a known value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParameterMode {
    #[default]
    Free,
    Fixed(f64),
}

impl ParameterMode {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    pub fn fixed_value(&self) -> Option<f64> {
        match self {
            Self::Free => None,
            Self::Fixed(value) => Some(*value),
        }
    }
}

/// Parameters fitted independently for each (event, band) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventParams {
    /// Source energy W
    pub source_energy: f64,
    /// Intrinsic attenuation coefficient b [1/s]
    pub intrinsic: f64,
    /// Scattering coefficient g0 [1/km]
    pub scattering: f64,
    /// Geometrical-spreading exponent n
    pub spreading: f64,
}

impl EventParams {
    /// Create new event parameters
    pub fn new(source_energy: f64, intrinsic: f64, scattering: f64, spreading: f64) -> Self {
        Self {
            source_energy,
            intrinsic,
            scattering,
            spreading,
        }
    }

    /// Intrinsic quality factor `Q = 2 pi f / b`; infinite without absorption.
    pub fn quality_factor(&self, frequency: f64) -> f64 {
        quality_factor(self.intrinsic, frequency)
    }

    /// Intrinsic attenuation coefficient for a quality factor at `frequency`.
    pub fn intrinsic_from_q(q: f64, frequency: f64) -> f64 {
        TAU * frequency / q
    }
}

pub(crate) fn quality_factor(intrinsic: f64, frequency: f64) -> f64 {
    if intrinsic > 0.0 {
        TAU * frequency / intrinsic
    } else {
        f64::INFINITY
    }
}

/// Everything the forward model needs for one (event, station) prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSet {
    pub event: EventParams,
    pub site_amplification: f64,
}

impl ParameterSet {
    pub fn new(event: EventParams, site_amplification: f64) -> Self {
        Self {
            event,
            site_amplification,
        }
    }
}

/// Site amplification per station. Stations without an entry are neutral.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteTable {
    factors: BTreeMap<String, f64>,
}

impl SiteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unity amplification for every listed station.
    pub fn neutral<I, S>(stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            factors: stations.into_iter().map(|s| (s.into(), 1.0)).collect(),
        }
    }

    pub fn get(&self, station: &str) -> f64 {
        self.factors.get(station).copied().unwrap_or(1.0)
    }

    pub fn contains(&self, station: &str) -> bool {
        self.factors.contains_key(station)
    }

    pub fn set(&mut self, station: impl Into<String>, factor: f64) {
        self.factors.insert(station.into(), factor);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.factors.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn stations(&self) -> impl Iterator<Item = &str> {
        self.factors.keys().map(String::as_str)
    }

    /// Multiply every factor by `scale`.
    pub fn scale(&mut self, scale: f64) {
        for factor in self.factors.values_mut() {
            *factor *= scale;
        }
    }

    /// Largest absolute change in log amplification of the stations in this
    /// table relative to `previous`. Stations only `previous` knows are not
    /// counted.
    pub fn max_log_change(&self, previous: &SiteTable) -> f64 {
        self.factors
            .iter()
            .map(|(sta, factor)| (factor.ln() - previous.get(sta).ln()).abs())
            .fold(0.0, f64::max)
    }

    /// Remove the scale ambiguity between source energy and site terms.
    ///
    /// Returns the factor every amplification was multiplied by, so callers
    /// can divide source energies by it. A missing reference station leaves
    /// the table untouched.
    pub fn normalize(&mut self, normalization: &SiteNormalization) -> f64 {
        if self.factors.is_empty() {
            return 1.0;
        }
        let scale = match normalization {
            SiteNormalization::GeometricMean { response } => {
                let logs: Vec<f64> = self.factors.values().map(|f| f.ln()).collect();
                let mean_log = stats::mean(&logs).unwrap_or(0.0);
                (response.ln() - mean_log).exp()
            }
            SiteNormalization::ReferenceStation { station, response } => {
                match self.factors.get(station) {
                    Some(&current) if current > 0.0 => response / current,
                    _ => 1.0,
                }
            }
        };
        self.scale(scale);
        scale
    }
}
