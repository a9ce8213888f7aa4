//! Per-event inversion
//!
//! Fits the source energy and the free attenuation parameters of one event
//! in one band to the log energy of all its station envelopes, with the
//! site amplifications held at the values handed in.

use std::collections::BTreeSet;

use nalgebra::DVector;
use serde::Serialize;
use thiserror::Error;

use super::solver::{levenberg_marquardt, ResidualModel, Stop};
use crate::band::FrequencyBand;
use crate::config::InversionConfig;
use crate::envelope::Envelope;
use crate::model::{ForwardModel, GreensCache};
use crate::params::{quality_factor, EventParams, ParameterSet, SiteTable};
use crate::stats;

/// Scattering coefficients are fitted as `ln g0` and kept above this bound.
const LN_SCATTERING_MIN: f64 = -40.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InversionError {
    #[error("event {event_id}: {stations} usable stations, at least {required} required")]
    SingularSystem {
        event_id: String,
        stations: usize,
        required: usize,
    },
    #[error("event {event_id}: {samples} samples cannot constrain {unknowns} unknowns")]
    Underdetermined {
        event_id: String,
        samples: usize,
        unknowns: usize,
    },
    #[error("event {event_id}: no convergence after {iterations} iterations ({reason})")]
    NonConvergence {
        event_id: String,
        iterations: usize,
        reason: String,
    },
}

impl InversionError {
    pub fn event_id(&self) -> &str {
        match self {
            Self::SingularSystem { event_id, .. }
            | Self::Underdetermined { event_id, .. }
            | Self::NonConvergence { event_id, .. } => event_id,
        }
    }

    /// Whether the event lacks the data to be fitted at all, as opposed to
    /// a fit that did not settle.
    pub fn is_insufficient_data(&self) -> bool {
        !matches!(self, Self::NonConvergence { .. })
    }
}

/// Starting point of a fit. Fixed parameters always take their configured
/// value; the guess only seeds the free ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialGuess {
    /// Seeded from the mean log residual when absent
    pub source_energy: Option<f64>,
    pub intrinsic: f64,
    pub scattering: f64,
    pub spreading: f64,
}

impl InitialGuess {
    pub fn from_config(config: &InversionConfig) -> Self {
        Self {
            source_energy: None,
            intrinsic: config.initial_intrinsic,
            scattering: config.initial_scattering,
            spreading: config.initial_spreading,
        }
    }

    /// Warm start from an earlier fit of the same event.
    pub fn from_params(params: &EventParams) -> Self {
        Self {
            source_energy: Some(params.source_energy),
            intrinsic: params.intrinsic,
            scattering: params.scattering,
            spreading: params.spreading,
        }
    }
}

/// One-sigma standard errors; `None` for fixed parameters or when the fit
/// has no redundancy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ParameterUncertainty {
    pub source_energy: Option<f64>,
    pub intrinsic: Option<f64>,
    pub scattering: Option<f64>,
    pub spreading: Option<f64>,
    pub quality_factor: Option<f64>,
}

/// Mean log residual of one station's envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationResidual {
    pub station: String,
    /// Site amplification the fit was run with
    pub site_amplification: f64,
    pub mean_residual: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    pub event_id: String,
    pub band: FrequencyBand,
    pub params: EventParams,
    /// Intrinsic Q at the band center
    pub quality_factor: f64,
    pub uncertainty: ParameterUncertainty,
    pub station_residuals: Vec<StationResidual>,
    /// `ln(observed) - ln(predicted)`, station by station
    pub residuals: Vec<f64>,
    /// RMS of `residuals`
    pub misfit: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl FitResult {
    pub fn station(&self, station: &str) -> Option<&StationResidual> {
        self.station_residuals.iter().find(|s| s.station == station)
    }

    /// Parameters predicting the envelope of `station`.
    pub fn parameter_set(&self, station: &str) -> ParameterSet {
        let site = self.station(station).map_or(1.0, |s| s.site_amplification);
        ParameterSet::new(self.params, site)
    }
}

/// Position of each free parameter in the unknown vector; `ln W` is slot 0.
#[derive(Debug, Clone, Copy)]
struct Layout {
    intrinsic: Option<usize>,
    scattering: Option<usize>,
    spreading: Option<usize>,
    len: usize,
}

impl Layout {
    fn new(config: &InversionConfig) -> Self {
        let mut len = 1;
        let mut slot = |free: bool| {
            free.then(|| {
                len += 1;
                len - 1
            })
        };
        let intrinsic = slot(config.intrinsic.is_free());
        let scattering = slot(config.scattering.is_free());
        let spreading = slot(config.geometric_spreading.is_free());
        Self {
            intrinsic,
            scattering,
            spreading,
            len,
        }
    }
}

struct StationSamples {
    station: String,
    distance: f64,
    ln_site: f64,
    times: Vec<f64>,
    ln_energy: Vec<f64>,
}

struct EventProblem<'a> {
    model: ForwardModel,
    layout: Layout,
    /// Values of the parameters the layout leaves fixed
    fixed: EventParams,
    stations: Vec<StationSamples>,
    cache: &'a mut GreensCache,
}

impl EventProblem<'_> {
    fn unpack(&self, x: &DVector<f64>) -> EventParams {
        let layout = &self.layout;
        EventParams {
            source_energy: x[0].exp(),
            intrinsic: layout.intrinsic.map_or(self.fixed.intrinsic, |i| x[i]),
            scattering: layout.scattering.map_or(self.fixed.scattering, |i| x[i].exp()),
            spreading: layout.spreading.map_or(self.fixed.spreading, |i| x[i]),
        }
    }

    fn pack(&self, params: &EventParams) -> DVector<f64> {
        let mut x = DVector::zeros(self.layout.len);
        x[0] = params.source_energy.ln();
        if let Some(i) = self.layout.intrinsic {
            x[i] = params.intrinsic;
        }
        if let Some(i) = self.layout.scattering {
            x[i] = params.scattering.ln();
        }
        if let Some(i) = self.layout.spreading {
            x[i] = params.spreading;
        }
        x
    }

    fn sample_count(&self) -> usize {
        self.stations.iter().map(|s| s.times.len()).sum()
    }
}

impl ResidualModel for EventProblem<'_> {
    fn residuals(&mut self, x: &DVector<f64>) -> DVector<f64> {
        let params = self.unpack(x);
        let ln_w = x[0];
        let mut out = Vec::with_capacity(self.sample_count());
        for sta in &self.stations {
            let greens = self.model.greens_on_grid(
                self.cache,
                sta.distance,
                &sta.times,
                params.scattering,
                params.spreading,
            );
            for ((&t, &ln_obs), &g) in sta.times.iter().zip(&sta.ln_energy).zip(greens) {
                let ln_pred = ln_w + sta.ln_site - params.intrinsic * t + g.ln();
                out.push(ln_obs - ln_pred);
            }
        }
        DVector::from_vec(out)
    }

    fn project(&self, x: &mut DVector<f64>) {
        if let Some(i) = self.layout.intrinsic {
            x[i] = x[i].max(0.0);
        }
        if let Some(i) = self.layout.scattering {
            x[i] = x[i].max(LN_SCATTERING_MIN);
        }
    }
}

/// Invert one event in one band with a fresh Green's-function cache.
pub fn invert_event(
    envelopes: &[Envelope],
    band: &FrequencyBand,
    sites: &SiteTable,
    initial_guess: &InitialGuess,
    config: &InversionConfig,
) -> Result<FitResult, InversionError> {
    let mut cache = GreensCache::new();
    invert_event_with_cache(envelopes, band, sites, initial_guess, config, &mut cache)
}

/// [`invert_event`] reusing `cache` across calls of the same run.
pub fn invert_event_with_cache(
    envelopes: &[Envelope],
    band: &FrequencyBand,
    sites: &SiteTable,
    initial_guess: &InitialGuess,
    config: &InversionConfig,
    cache: &mut GreensCache,
) -> Result<FitResult, InversionError> {
    let event_id = envelopes
        .first()
        .map(|e| e.event_id().to_string())
        .unwrap_or_default();

    let stations: Vec<StationSamples> = envelopes
        .iter()
        .filter(|e| e.is_usable())
        .filter_map(|e| {
            let (times, ln_energy): (Vec<f64>, Vec<f64>) = e
                .fit_samples(config.noise_floor_factor)
                .map(|(t, energy)| (t, energy.ln()))
                .unzip();
            (!times.is_empty()).then(|| StationSamples {
                station: e.station().to_string(),
                distance: e.distance_km(),
                ln_site: sites.get(e.station()).ln(),
                times,
                ln_energy,
            })
        })
        .collect();

    let distinct: BTreeSet<&str> = stations.iter().map(|s| s.station.as_str()).collect();
    if distinct.len() < config.min_stations {
        return Err(InversionError::SingularSystem {
            event_id,
            stations: distinct.len(),
            required: config.min_stations,
        });
    }

    let layout = Layout::new(config);
    let fixed = EventParams {
        source_energy: 1.0,
        intrinsic: config.intrinsic.fixed_value().unwrap_or(initial_guess.intrinsic),
        scattering: config.scattering.fixed_value().unwrap_or(initial_guess.scattering),
        spreading: config
            .geometric_spreading
            .fixed_value()
            .unwrap_or(initial_guess.spreading),
    };
    let mut problem = EventProblem {
        model: ForwardModel::new(config.scattering_model, config.velocity_km_s, *band),
        layout,
        fixed,
        stations,
        cache,
    };

    let samples = problem.sample_count();
    if samples < layout.len {
        return Err(InversionError::Underdetermined {
            event_id,
            samples,
            unknowns: layout.len,
        });
    }

    let mut start = fixed;
    start.scattering = start.scattering.max(LN_SCATTERING_MIN.exp());
    start.intrinsic = start.intrinsic.max(0.0);
    let mut x0 = problem.pack(&start);
    match initial_guess.source_energy {
        Some(w) if w.is_finite() && w > 0.0 => x0[0] = w.ln(),
        _ => {
            // Residuals are linear in ln W, so their mean at ln W = 0 is the
            // least-squares source term for the other starting values.
            x0[0] = 0.0;
            let offset = problem.residuals(&x0);
            x0[0] = offset.mean();
        }
    }

    let outcome = levenberg_marquardt(&mut problem, x0, &config.solver);
    let reason = match outcome.stop {
        Stop::Converged => None,
        Stop::IterationLimit => Some("iteration limit reached".to_string()),
        Stop::Timeout => Some("time budget exhausted".to_string()),
        Stop::NonFinite => Some("non-finite residuals".to_string()),
        Stop::Stalled => Some("step rejected at maximum damping".to_string()),
    };
    if let Some(reason) = reason {
        tracing::debug!(event = %event_id, %band, iterations = outcome.iterations, "{reason}");
        return Err(InversionError::NonConvergence {
            event_id,
            iterations: outcome.iterations,
            reason,
        });
    }

    let params = problem.unpack(&outcome.x);
    let frequency = band.center();
    let q = quality_factor(params.intrinsic, frequency);

    let sigma = |slot: Option<usize>| {
        let cov = outcome.covariance.as_ref()?;
        let i = slot?;
        let var = cov[(i, i)];
        (var.is_finite() && var >= 0.0).then(|| var.sqrt())
    };
    let sigma_intrinsic = sigma(layout.intrinsic);
    let uncertainty = ParameterUncertainty {
        source_energy: sigma(Some(0)).map(|s| params.source_energy * s),
        intrinsic: sigma_intrinsic,
        scattering: sigma(layout.scattering).map(|s| params.scattering * s),
        spreading: sigma(layout.spreading),
        quality_factor: sigma_intrinsic
            .filter(|_| params.intrinsic > 0.0)
            .map(|s| q * s / params.intrinsic),
    };

    let residuals: Vec<f64> = outcome.residuals.iter().copied().collect();
    let mut station_residuals = Vec::with_capacity(problem.stations.len());
    let mut offset = 0;
    for sta in &problem.stations {
        let slice = &residuals[offset..offset + sta.times.len()];
        offset += sta.times.len();
        station_residuals.push(StationResidual {
            station: sta.station.clone(),
            site_amplification: sta.ln_site.exp(),
            mean_residual: stats::mean(slice).unwrap_or(0.0),
            samples: slice.len(),
        });
    }

    let misfit = stats::rms(&residuals);
    tracing::debug!(
        event = %event_id,
        %band,
        q,
        misfit,
        cost = outcome.cost,
        iterations = outcome.iterations,
        "event fitted"
    );

    Ok(FitResult {
        event_id,
        band: *band,
        params,
        quality_factor: q,
        uncertainty,
        station_residuals,
        residuals,
        misfit,
        iterations: outcome.iterations,
        converged: true,
    })
}
