//! Forward Model
//!
//! Energy density of a point source in a scattering, absorbing medium:
//!
//! ```text
//! E(r, t) = W R exp(-b t) [ r^-n exp(-g0 v t) + S(r, t) ]
//! ```
//!
//! The bracket is the Green's function `G`. Its first term is the coherent
//! wave losing energy to scattering, `S` the scattered energy, given either
//! by the single-scattering kernel or by the diffusion approximation.

use std::collections::HashMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::band::FrequencyBand;
use crate::params::ParameterSet;

/// Lower bound on `v t / r` for the single-scattering kernel, which has an
/// integrable singularity at the direct arrival.
const MIN_LAPSE_RATIO: f64 = 1.0 + 1e-3;

/// Distances within one bucket share a cached Green's function [km].
const DISTANCE_BUCKET_KM: f64 = 1e-3;

const DEFAULT_CACHE_ENTRIES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScatteringModel {
    #[default]
    SingleScattering,
    Diffusive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardModel {
    variant: ScatteringModel,
    velocity: f64,
    band: FrequencyBand,
}

impl ForwardModel {
    pub fn new(variant: ScatteringModel, velocity_km_s: f64, band: FrequencyBand) -> Self {
        Self {
            variant,
            velocity: velocity_km_s,
            band,
        }
    }

    pub fn variant(&self) -> ScatteringModel {
        self.variant
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn band(&self) -> &FrequencyBand {
        &self.band
    }

    /// Predicted energy at distance `r` [km] and lapse time `t` [s].
    pub fn energy(&self, r: f64, t: f64, params: &ParameterSet) -> f64 {
        let event = &params.event;
        event.source_energy
            * params.site_amplification
            * (-event.intrinsic * t).exp()
            * self.greens_function(r, t, event.scattering, event.spreading)
    }

    /// Green's function without source, site and absorption factors.
    pub fn greens_function(&self, r: f64, t: f64, g0: f64, n: f64) -> f64 {
        let coherent = r.powf(-n) * (-g0 * self.velocity * t).exp();
        coherent + self.scattered(r, t, g0, n)
    }

    fn scattered(&self, r: f64, t: f64, g0: f64, n: f64) -> f64 {
        if g0 <= 0.0 || t <= 0.0 {
            return 0.0;
        }
        let a = self.velocity * t / r;
        match self.variant {
            ScatteringModel::SingleScattering => {
                if a <= 1.0 {
                    return 0.0;
                }
                let a = a.max(MIN_LAPSE_RATIO);
                let kernel = ((a + 1.0) / (a - 1.0)).ln() / a;
                g0 * r.powf(1.0 - n) * kernel
            }
            ScatteringModel::Diffusive => {
                let x = g0 * r;
                r.powf(-n) * (3.0 * x / (4.0 * PI * a)).powf(1.5) * (-3.0 * x / (4.0 * a)).exp()
            }
        }
    }

    /// Green's function on a time grid, served from `cache` when the same
    /// (band, scattering, spreading, distance, grid) was evaluated before.
    pub fn greens_on_grid<'c>(
        &self,
        cache: &'c mut GreensCache,
        r: f64,
        times: &[f64],
        g0: f64,
        n: f64,
    ) -> &'c [f64] {
        let bucket = (r / DISTANCE_BUCKET_KM).round() as i64;
        let key = GreensKey {
            variant: self.variant,
            band: self.band.key(),
            velocity: self.velocity.to_bits(),
            scattering: g0.to_bits(),
            spreading: n.to_bits(),
            distance_bucket: bucket,
            grid: grid_key(times),
        };
        let r_bucket = bucket as f64 * DISTANCE_BUCKET_KM;
        cache.get_or_insert_with(key, || {
            times
                .iter()
                .map(|&t| self.greens_function(r_bucket, t, g0, n))
                .collect()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GreensKey {
    variant: ScatteringModel,
    band: (u64, u64),
    velocity: u64,
    scattering: u64,
    spreading: u64,
    distance_bucket: i64,
    grid: (u64, u64, usize),
}

fn grid_key(times: &[f64]) -> (u64, u64, usize) {
    let first = times.first().copied().unwrap_or(0.0);
    let last = times.last().copied().unwrap_or(0.0);
    (first.to_bits(), last.to_bits(), times.len())
}

/// Green's-function tables of one inversion run.
///
/// Created per run and dropped with it; when it grows past its entry limit
/// it is cleared rather than evicting piecemeal.
#[derive(Debug, Clone)]
pub struct GreensCache {
    tables: HashMap<GreensKey, Vec<f64>>,
    max_entries: usize,
    hits: usize,
    misses: usize,
}

impl Default for GreensCache {
    fn default() -> Self {
        Self::with_capacity_limit(DEFAULT_CACHE_ENTRIES)
    }
}

impl GreensCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            tables: HashMap::new(),
            max_entries: max_entries.max(1),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    fn get_or_insert_with<F>(&mut self, key: GreensKey, compute: F) -> &[f64]
    where
        F: FnOnce() -> Vec<f64>,
    {
        if self.tables.contains_key(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            if self.tables.len() >= self.max_entries {
                self.tables.clear();
            }
            self.tables.insert(key, compute());
        }
        self.tables.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }
}
