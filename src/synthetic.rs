//! Synthetic envelopes and traces
//!
//! Forward-models known parameters into envelopes (optionally with seeded
//! log-normal noise) or into raw traces whose band-limited energy follows
//! the model. Used to check that a configuration can resolve what it is
//! asked to resolve.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, StandardNormal};

use crate::band::FrequencyBand;
use crate::dataset::{Dataset, Segment};
use crate::envelope::{Envelope, EnvelopeError, TimeWindow, Trace};
use crate::model::{ForwardModel, ScatteringModel};
use crate::params::{EventParams, ParameterSet};

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStation {
    pub name: String,
    pub distance_km: f64,
    pub site_amplification: f64,
}

impl SyntheticStation {
    pub fn new(name: impl Into<String>, distance_km: f64, site_amplification: f64) -> Self {
        Self {
            name: name.into(),
            distance_km,
            site_amplification,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticEvent {
    pub id: String,
    pub source_energy: f64,
    pub stations: Vec<SyntheticStation>,
}

/// Medium and sampling of a synthetic data set.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub band: FrequencyBand,
    pub model: ScatteringModel,
    pub velocity_km_s: f64,
    /// Intrinsic attenuation coefficient b [1/s]
    pub intrinsic: f64,
    /// Scattering coefficient g0 [1/km]
    pub scattering: f64,
    pub spreading: f64,
    /// Envelope sampling interval [s]
    pub dt: f64,
    /// Coda length after the direct arrival [s]
    pub duration: f64,
    /// Delay of the first envelope sample after the direct arrival [s]
    pub lead: f64,
    /// Standard deviation of the multiplicative log-normal noise
    pub noise_sigma: f64,
    /// Noise-floor energy attached to envelopes or added to traces
    pub noise_level: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            band: FrequencyBand::octave(4.0),
            model: ScatteringModel::SingleScattering,
            velocity_km_s: 3.5,
            intrinsic: 0.05,
            scattering: 0.01,
            spreading: 1.0,
            dt: 0.5,
            duration: 40.0,
            lead: 1.0,
            noise_sigma: 0.0,
            noise_level: 0.0,
            seed: 42,
        }
    }
}

impl SyntheticConfig {
    pub fn forward_model(&self) -> ForwardModel {
        ForwardModel::new(self.model, self.velocity_km_s, self.band)
    }

    pub fn event_params(&self, source_energy: f64) -> EventParams {
        EventParams::new(source_energy, self.intrinsic, self.scattering, self.spreading)
    }

    fn log_noise(&self) -> Option<Normal<f64>> {
        if self.noise_sigma > 0.0 {
            Normal::new(0.0, self.noise_sigma).ok()
        } else {
            None
        }
    }
}

/// One envelope per (event, station), sampled from `lead` seconds after the
/// direct arrival for `duration` seconds.
pub fn synthetic_envelopes(
    events: &[SyntheticEvent],
    config: &SyntheticConfig,
) -> Result<Vec<Envelope>, EnvelopeError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let noise = config.log_noise();
    let model = config.forward_model();
    let samples = (config.duration / config.dt).floor() as usize + 1;

    let mut envelopes = Vec::new();
    for event in events {
        let params = config.event_params(event.source_energy);
        for station in &event.stations {
            let set = ParameterSet::new(params, station.site_amplification);
            let travel = station.distance_km / config.velocity_km_s;
            let times: Vec<f64> = (0..samples)
                .map(|k| travel + config.lead + k as f64 * config.dt)
                .collect();
            let energy: Vec<f64> = times
                .iter()
                .map(|&t| {
                    let clean = model.energy(station.distance_km, t, &set);
                    match &noise {
                        Some(dist) => clean * dist.sample(&mut rng).exp(),
                        None => clean,
                    }
                })
                .collect();
            let signal = energy.iter().sum::<f64>() / energy.len() as f64;
            let snr = if config.noise_level > 0.0 {
                signal / config.noise_level
            } else {
                f64::INFINITY
            };
            let envelope = Envelope::new(
                event.id.as_str(),
                station.name.as_str(),
                config.band,
                times,
                energy,
                station.distance_km,
                travel,
            )?
            .with_noise(config.noise_level, snr, 0.0);
            envelopes.push(envelope);
        }
    }
    Ok(envelopes)
}

pub fn synthetic_dataset(
    events: &[SyntheticEvent],
    config: &SyntheticConfig,
) -> Result<Dataset, EnvelopeError> {
    Ok(Dataset::from_envelopes(
        config.band,
        synthetic_envelopes(events, config)?,
    ))
}

/// Raw traces whose energy in `config.band` follows the forward model.
///
/// White Gaussian noise is shaped by the square root of the predicted
/// energy and scaled so that the band-limited part carries that energy.
/// Each trace starts at the event origin; the noise window covers the time
/// before the direct arrival.
pub fn synthetic_segments(
    events: &[SyntheticEvent],
    config: &SyntheticConfig,
    sample_rate: f64,
) -> Vec<Segment> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let model = config.forward_model();
    let nyquist = sample_rate / 2.0;
    let band_gain = (nyquist / config.band.width()).sqrt();
    let background = config.noise_level.sqrt() * band_gain;

    let mut segments = Vec::new();
    for event in events {
        let params = config.event_params(event.source_energy);
        for station in &event.stations {
            let set = ParameterSet::new(params, station.site_amplification);
            let travel = station.distance_km / config.velocity_km_s;
            let end = travel + config.lead + config.duration;
            let n = (end * sample_rate).ceil() as usize;
            let samples = (0..n)
                .map(|i| {
                    let t = i as f64 / sample_rate;
                    let coda = if t >= travel {
                        model.energy(station.distance_km, t, &set).sqrt() * band_gain
                    } else {
                        0.0
                    };
                    let z: f64 = StandardNormal.sample(&mut rng);
                    (coda + background) * z
                })
                .collect();
            segments.push(Segment {
                trace: Trace {
                    event_id: event.id.clone(),
                    station: station.name.clone(),
                    samples,
                    sample_rate,
                    start_offset: 0.0,
                    distance_km: station.distance_km,
                    travel_time: travel,
                },
                noise_window: TimeWindow::new(0.0, 0.9 * travel),
                signal_window: TimeWindow::new(travel + config.lead, end),
            });
        }
    }
    segments
}
