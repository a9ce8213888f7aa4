//! Envelope Builder
//!
//! Turns a raw trace into a band-limited, smoothed energy envelope and
//! decides whether it carries enough signal above the pre-event noise.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::band::FrequencyBand;
use crate::config::{EnvelopeConfig, SmoothingWindow};
use crate::filter::BandPass;

/// Raw samples of one (event, station) recording plus the metadata the
/// waveform collaborator resolved for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub event_id: String,
    pub station: String,
    pub samples: Vec<f64>,
    /// Sampling rate [Hz]
    pub sample_rate: f64,
    /// Time of the first sample relative to the event origin [s]
    pub start_offset: f64,
    /// Hypocentral distance [km]
    pub distance_km: f64,
    /// Direct-wave travel time [s]
    pub travel_time: f64,
}

/// Time interval relative to the event origin [s].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("insufficient data for {event_id}/{station}: {reason}")]
    InsufficientData {
        event_id: String,
        station: String,
        reason: String,
    },
    #[error("invalid envelope for {event_id}/{station}: {reason}")]
    InvalidEnvelope {
        event_id: String,
        station: String,
        reason: String,
    },
}

/// Energy-vs-time samples of one (event, station, band) triple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    event_id: String,
    station: String,
    band: FrequencyBand,
    times: Vec<f64>,
    energy: Vec<f64>,
    sampling_interval: f64,
    noise_level: f64,
    snr: f64,
    usable: bool,
    distance_km: f64,
    travel_time: f64,
}

impl Envelope {
    /// Validate and wrap envelope samples.
    ///
    /// Times must be finite and strictly increasing, energies finite and
    /// non-negative. The envelope starts noise-free and usable.
    pub fn new(
        event_id: impl Into<String>,
        station: impl Into<String>,
        band: FrequencyBand,
        times: Vec<f64>,
        energy: Vec<f64>,
        distance_km: f64,
        travel_time: f64,
    ) -> Result<Self, EnvelopeError> {
        let event_id = event_id.into();
        let station = station.into();
        let invalid = |reason: String| EnvelopeError::InvalidEnvelope {
            event_id: event_id.clone(),
            station: station.clone(),
            reason,
        };

        if times.is_empty() {
            return Err(invalid("no samples".to_string()));
        }
        if times.len() != energy.len() {
            return Err(invalid(format!(
                "{} times but {} energy samples",
                times.len(),
                energy.len()
            )));
        }
        if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(invalid("time offsets must be finite and strictly increasing".to_string()));
        }
        if let Some(bad) = energy.iter().find(|e| !(e.is_finite() && **e >= 0.0)) {
            return Err(invalid(format!("energy sample {bad} is negative or not finite")));
        }
        if !(distance_km.is_finite() && distance_km > 0.0) {
            return Err(invalid(format!("distance {distance_km} km must be > 0")));
        }
        if !travel_time.is_finite() {
            return Err(invalid("travel time must be finite".to_string()));
        }

        let sampling_interval = if times.len() > 1 {
            (times[times.len() - 1] - times[0]) / (times.len() - 1) as f64
        } else {
            0.0
        };

        Ok(Self {
            event_id,
            station,
            band,
            times,
            energy,
            sampling_interval,
            noise_level: 0.0,
            snr: f64::INFINITY,
            usable: true,
            distance_km,
            travel_time,
        })
    }

    /// Attach a noise-floor estimate and derive the usable flag from the
    /// given signal-to-noise ratio.
    pub fn with_noise(mut self, noise_level: f64, snr: f64, snr_threshold: f64) -> Self {
        self.noise_level = noise_level.max(0.0);
        self.snr = snr;
        self.usable = snr >= snr_threshold;
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn band(&self) -> &FrequencyBand {
        &self.band
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn energy(&self) -> &[f64] {
        &self.energy
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn sampling_interval(&self) -> f64 {
        self.sampling_interval
    }

    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }

    pub fn snr(&self) -> f64 {
        self.snr
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_km
    }

    pub fn travel_time(&self) -> f64 {
        self.travel_time
    }

    /// Samples entering the fit: after the direct arrival and above the
    /// scaled noise floor.
    pub fn fit_samples(&self, noise_floor_factor: f64) -> impl Iterator<Item = (f64, f64)> + '_ {
        let floor = self.noise_level * noise_floor_factor;
        self.times
            .iter()
            .zip(self.energy.iter())
            .filter(move |(&t, &e)| t >= self.travel_time && e > floor && e > 0.0)
            .map(|(&t, &e)| (t, e))
    }
}

fn sample_range(
    trace: &Trace,
    window: TimeWindow,
    label: &str,
) -> Result<std::ops::Range<usize>, String> {
    if !(window.start.is_finite() && window.end.is_finite()) || window.end <= window.start {
        return Err(format!("{label} window {:?} is empty or inverted", window));
    }
    let n = trace.samples.len() as f64;
    let first = ((window.start - trace.start_offset) * trace.sample_rate).round();
    let last = ((window.end - trace.start_offset) * trace.sample_rate).round();
    if first < 0.0 || last > n {
        return Err(format!(
            "{label} window {:.2}-{:.2} s lies outside the {:.2} s segment",
            window.start,
            window.end,
            n / trace.sample_rate
        ));
    }
    Ok(first as usize..last as usize)
}

fn smoothing_weights(len: usize, window: SmoothingWindow) -> Vec<f64> {
    match window {
        SmoothingWindow::Flat => vec![1.0; len],
        SmoothingWindow::Bartlett => {
            let half = (len as f64 + 1.0) / 2.0;
            (0..len)
                .map(|i| 1.0 - ((i as f64 + 1.0) - half).abs() / half)
                .collect()
        }
    }
}

/// Centred weighted moving average, renormalized near the edges.
fn smooth(energy: &[f64], len: usize, window: SmoothingWindow) -> Vec<f64> {
    if len <= 1 {
        return energy.to_vec();
    }
    let weights = smoothing_weights(len, window);
    let half = len / 2;
    let n = energy.len();
    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (k, &w) in weights.iter().enumerate() {
                let j = i as isize + k as isize - half as isize;
                if j >= 0 && (j as usize) < n {
                    acc += w * energy[j as usize];
                    norm += w;
                }
            }
            if norm > 0.0 {
                acc / norm
            } else {
                0.0
            }
        })
        .collect()
}

fn mean_of(values: &[f64]) -> f64 {
    crate::stats::mean(values).unwrap_or(0.0)
}

/// Build the energy envelope of `trace` in `band`.
///
/// The noise level is the mean smoothed energy in `noise_window`; the
/// envelope samples cover `signal_window`. Both windows are relative to the
/// event origin.
pub fn build_envelope(
    trace: &Trace,
    band: &FrequencyBand,
    noise_window: TimeWindow,
    signal_window: TimeWindow,
    config: &EnvelopeConfig,
) -> Result<Envelope, EnvelopeError> {
    let insufficient = |reason: String| EnvelopeError::InsufficientData {
        event_id: trace.event_id.clone(),
        station: trace.station.clone(),
        reason,
    };

    if !(trace.sample_rate.is_finite() && trace.sample_rate > 0.0) {
        return Err(insufficient(format!(
            "sampling rate {} Hz is not positive",
            trace.sample_rate
        )));
    }
    let filter = BandPass::butterworth(config.filter_order, band, trace.sample_rate)
        .ok_or_else(|| {
            insufficient(format!(
                "band {band} does not fit below Nyquist at {} Hz",
                trace.sample_rate
            ))
        })?;

    let noise_range = sample_range(trace, noise_window, "noise").map_err(insufficient)?;
    let signal_range = sample_range(trace, signal_window, "signal").map_err(insufficient)?;
    if noise_range.is_empty() {
        return Err(insufficient("noise window holds no samples".to_string()));
    }
    if signal_range.len() < config.min_samples {
        return Err(insufficient(format!(
            "signal window holds {} samples, at least {} required",
            signal_range.len(),
            config.min_samples
        )));
    }

    let offset = mean_of(&trace.samples);
    let mut filtered: Vec<f64> = trace.samples.iter().map(|x| x - offset).collect();
    if config.zero_phase {
        filter.apply_zero_phase(&mut filtered);
    } else {
        filter.apply(&mut filtered);
    }

    let squared: Vec<f64> = filtered.iter().map(|x| x * x).collect();
    let smooth_len = (config.smoothing_secs * trace.sample_rate).round() as usize;
    let energy: Vec<f64> = smooth(&squared, smooth_len, config.smoothing_window)
        .into_iter()
        .map(|e| e.max(0.0))
        .collect();

    let noise_level = mean_of(&energy[noise_range]);
    let signal_level = mean_of(&energy[signal_range.clone()]);
    let snr = if noise_level > 0.0 {
        signal_level / noise_level
    } else {
        f64::INFINITY
    };

    let dt = 1.0 / trace.sample_rate;
    let mut times = Vec::with_capacity(signal_range.len() / config.decimate + 1);
    let mut values = Vec::with_capacity(times.capacity());
    for (block_idx, block) in energy[signal_range.clone()]
        .chunks(config.decimate)
        .enumerate()
    {
        let first = signal_range.start + block_idx * config.decimate;
        let center = first as f64 + (block.len() as f64 - 1.0) / 2.0;
        times.push(trace.start_offset + center * dt);
        values.push(mean_of(block));
    }

    let envelope = Envelope::new(
        trace.event_id.clone(),
        trace.station.clone(),
        *band,
        times,
        values,
        trace.distance_km,
        trace.travel_time,
    )?
    .with_noise(noise_level, snr, config.snr_threshold);

    if !envelope.is_usable() {
        tracing::debug!(
            event = %trace.event_id,
            station = %trace.station,
            %band,
            snr,
            "envelope below SNR threshold"
        );
    }
    Ok(envelope)
}
