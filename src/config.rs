use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::band::FrequencyBand;
use crate::model::ScatteringModel;
use crate::params::ParameterMode;
use crate::Error;

/// Statistic pooling the per-event site estimates of one station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SiteAggregation {
    #[default]
    Median,
    Mean,
    /// Mean after trimming the given fraction from each tail.
    TrimmedMean(f64),
}

/// Spread measure used by the residual post-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutlierRule {
    /// `|r - median| > k * 1.4826 * MAD`
    #[default]
    Mad,
    /// `|r - mean| > k * sigma`
    StdDev,
}

/// How the scale ambiguity between source energy and site terms is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteNormalization {
    /// Geometric mean of all site amplifications equals `response`.
    GeometricMean { response: f64 },
    /// One station's amplification is pinned to `response`.
    ReferenceStation { station: String, response: f64 },
}

impl Default for SiteNormalization {
    fn default() -> Self {
        Self::GeometricMean { response: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingWindow {
    #[default]
    Flat,
    Bartlett,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Butterworth poles per corner
    #[serde_as(as = "DefaultOnNull")]
    pub filter_order: usize,
    /// Run the band-pass forward and backward
    #[serde_as(as = "DefaultOnNull")]
    pub zero_phase: bool,
    /// Smoothing window length [s]; zero disables smoothing
    #[serde_as(as = "DefaultOnNull")]
    pub smoothing_secs: f64,
    pub smoothing_window: SmoothingWindow,
    /// Block-average this many samples into one envelope sample
    #[serde_as(as = "DefaultOnNull")]
    pub decimate: usize,
    /// Minimum number of raw samples inside the signal window
    #[serde_as(as = "DefaultOnNull")]
    pub min_samples: usize,
    /// Signal-to-noise ratio below which an envelope is unusable
    #[serde_as(as = "DefaultOnNull")]
    pub snr_threshold: f64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            filter_order: 2,
            zero_phase: true,
            smoothing_secs: 1.0,
            smoothing_window: SmoothingWindow::Flat,
            decimate: 1,
            min_samples: 10,
            snr_threshold: 2.0,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum Levenberg-Marquardt iterations
    #[serde_as(as = "DefaultOnNull")]
    pub max_iterations: usize,
    /// Relative cost / step tolerance
    #[serde_as(as = "DefaultOnNull")]
    pub tolerance: f64,
    /// Initial damping factor
    #[serde_as(as = "DefaultOnNull")]
    pub lambda_init: f64,
    /// Damping increase on rejected step
    #[serde_as(as = "DefaultOnNull")]
    pub lambda_up: f64,
    /// Damping decrease on accepted step
    #[serde_as(as = "DefaultOnNull")]
    pub lambda_down: f64,
    /// Relative finite-difference step for the Jacobian
    #[serde_as(as = "DefaultOnNull")]
    pub fd_step: f64,
    /// Huber threshold on log residuals; plain least squares when unset
    pub huber_delta: Option<f64>,
    /// Wall-clock budget per event fit [s]
    pub timeout_secs: Option<f64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-9,
            lambda_init: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            fd_step: 1e-6,
            huber_delta: None,
            timeout_secs: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionConfig {
    pub bands: Vec<FrequencyBand>,
    /// Average shear-wave velocity [km/s]
    #[serde_as(as = "DefaultOnNull")]
    pub velocity_km_s: f64,
    pub scattering_model: ScatteringModel,
    pub geometric_spreading: ParameterMode,
    pub intrinsic: ParameterMode,
    pub scattering: ParameterMode,
    /// Starting geometrical-spreading exponent when it is free
    #[serde_as(as = "DefaultOnNull")]
    pub initial_spreading: f64,
    /// Starting intrinsic attenuation coefficient [1/s]
    #[serde_as(as = "DefaultOnNull")]
    pub initial_intrinsic: f64,
    /// Starting scattering coefficient [1/km]
    #[serde_as(as = "DefaultOnNull")]
    pub initial_scattering: f64,
    /// Envelope samples at or below `noise * factor` are not fitted
    #[serde_as(as = "DefaultOnNull")]
    pub noise_floor_factor: f64,
    /// Minimum usable stations per event and band
    #[serde_as(as = "DefaultOnNull")]
    pub min_stations: usize,
    pub outlier_rule: OutlierRule,
    /// Multiple of the robust spread beyond which an envelope is rejected
    #[serde_as(as = "DefaultOnNull")]
    pub outlier_threshold: f64,
    pub site_aggregation: SiteAggregation,
    pub site_normalization: SiteNormalization,
    /// Maximum log change of any site term considered converged
    #[serde_as(as = "DefaultOnNull")]
    pub site_tolerance: f64,
    #[serde_as(as = "DefaultOnNull")]
    pub max_coupling_iterations: usize,
    /// Fit bands and events on the rayon pool
    #[serde_as(as = "DefaultOnNull")]
    pub parallel: bool,
    pub envelope: EnvelopeConfig,
    pub solver: SolverConfig,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            bands: [1.5, 3.0, 6.0, 12.0]
                .into_iter()
                .map(FrequencyBand::octave)
                .collect(),
            velocity_km_s: 3.5,
            scattering_model: ScatteringModel::SingleScattering,
            geometric_spreading: ParameterMode::Fixed(1.0),
            intrinsic: ParameterMode::Free,
            scattering: ParameterMode::Free,
            initial_spreading: 1.0,
            initial_intrinsic: 0.05,
            initial_scattering: 0.01,
            noise_floor_factor: 1.0,
            min_stations: 3,
            outlier_rule: OutlierRule::Mad,
            outlier_threshold: 3.0,
            site_aggregation: SiteAggregation::Median,
            site_normalization: SiteNormalization::default(),
            site_tolerance: 1e-4,
            max_coupling_iterations: 20,
            parallel: true,
            envelope: EnvelopeConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

impl InversionConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        let cfg: InversionConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Number of unknowns every per-event fit solves for.
    pub fn free_parameter_count(&self) -> usize {
        1 + [self.intrinsic, self.scattering, self.geometric_spreading]
            .iter()
            .filter(|mode| mode.is_free())
            .count()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.bands.is_empty() {
            return Err(invalid("at least one frequency band is required"));
        }
        for band in &self.bands {
            band.validate()?;
        }

        if !(self.velocity_km_s.is_finite() && self.velocity_km_s > 0.0) {
            return Err(invalid("velocity_km_s must be finite and > 0"));
        }

        match self.intrinsic {
            ParameterMode::Fixed(b) if !(b.is_finite() && b >= 0.0) => {
                return Err(invalid("fixed intrinsic attenuation must be finite and >= 0"));
            }
            ParameterMode::Free if !(self.initial_intrinsic.is_finite() && self.initial_intrinsic >= 0.0) => {
                return Err(invalid("initial_intrinsic must be finite and >= 0"));
            }
            _ => {}
        }

        match self.scattering {
            ParameterMode::Fixed(g0) if !(g0.is_finite() && g0 >= 0.0) => {
                return Err(invalid("fixed scattering coefficient must be finite and >= 0"));
            }
            ParameterMode::Free if !(self.initial_scattering.is_finite() && self.initial_scattering > 0.0) => {
                return Err(invalid(
                    "initial_scattering must be finite and > 0 when scattering is free",
                ));
            }
            _ => {}
        }

        match self.geometric_spreading {
            ParameterMode::Fixed(n) if !n.is_finite() => {
                return Err(invalid("fixed geometric spreading exponent must be finite"));
            }
            ParameterMode::Free if !self.initial_spreading.is_finite() => {
                return Err(invalid("initial_spreading must be finite"));
            }
            _ => {}
        }

        if !(self.noise_floor_factor.is_finite() && self.noise_floor_factor >= 0.0) {
            return Err(invalid("noise_floor_factor must be finite and >= 0"));
        }

        if self.min_stations == 0 {
            return Err(invalid("min_stations must be greater than zero"));
        }

        if !(self.outlier_threshold.is_finite() && self.outlier_threshold > 0.0) {
            return Err(invalid("outlier_threshold must be finite and > 0"));
        }

        if let SiteAggregation::TrimmedMean(fraction) = self.site_aggregation {
            if !(0.0..0.5).contains(&fraction) {
                return Err(invalid("trimmed mean fraction must be in [0, 0.5)"));
            }
        }

        let response = match &self.site_normalization {
            SiteNormalization::GeometricMean { response } => *response,
            SiteNormalization::ReferenceStation { station, response } => {
                if station.is_empty() {
                    return Err(invalid("reference station name must not be empty"));
                }
                *response
            }
        };
        if !(response.is_finite() && response > 0.0) {
            return Err(invalid("site normalization response must be finite and > 0"));
        }

        if !(self.site_tolerance.is_finite() && self.site_tolerance > 0.0) {
            return Err(invalid("site_tolerance must be finite and > 0"));
        }

        if self.max_coupling_iterations == 0 {
            return Err(invalid("max_coupling_iterations must be greater than zero"));
        }

        self.envelope.validate()?;
        self.solver.validate()?;
        Ok(())
    }
}

impl EnvelopeConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=8).contains(&self.filter_order) {
            return Err(invalid("envelope.filter_order must be in 1..=8"));
        }
        if !(self.smoothing_secs.is_finite() && self.smoothing_secs >= 0.0) {
            return Err(invalid("envelope.smoothing_secs must be finite and >= 0"));
        }
        if self.decimate == 0 {
            return Err(invalid("envelope.decimate must be greater than zero"));
        }
        if self.min_samples == 0 {
            return Err(invalid("envelope.min_samples must be greater than zero"));
        }
        if !(self.snr_threshold.is_finite() && self.snr_threshold >= 0.0) {
            return Err(invalid("envelope.snr_threshold must be finite and >= 0"));
        }
        Ok(())
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_iterations == 0 {
            return Err(invalid("solver.max_iterations must be greater than zero"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(invalid("solver.tolerance must be finite and > 0"));
        }
        if !(self.lambda_init.is_finite() && self.lambda_init > 0.0) {
            return Err(invalid("solver.lambda_init must be finite and > 0"));
        }
        if !(self.lambda_up > 1.0) || !(self.lambda_down > 0.0 && self.lambda_down < 1.0) {
            return Err(invalid(
                "solver.lambda_up must be > 1 and solver.lambda_down in (0, 1)",
            ));
        }
        if !(self.fd_step.is_finite() && self.fd_step > 0.0) {
            return Err(invalid("solver.fd_step must be finite and > 0"));
        }
        if let Some(delta) = self.huber_delta {
            if !(delta.is_finite() && delta > 0.0) {
                return Err(invalid("solver.huber_delta must be finite and > 0"));
            }
        }
        if let Some(timeout) = self.timeout_secs {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(invalid("solver.timeout_secs must be finite and > 0"));
            }
        }
        Ok(())
    }
}
