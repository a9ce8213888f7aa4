//! Result Aggregator
//!
//! Final per-band results and a flat, queryable view of them. No numerics
//! beyond summary statistics happen here.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::band::FrequencyBand;
use crate::dataset::Exclusion;
use crate::inversion::{ConvergenceReport, FitResult};
use crate::params::SiteTable;
use crate::stats;

/// Final disposition of one (event, band) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Converged,
    ExcludedInsufficientData,
    ExcludedNonConvergent,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Converged => "converged",
            Self::ExcludedInsufficientData => "excluded-insufficient-data",
            Self::ExcludedNonConvergent => "excluded-non-convergent",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventOutcome {
    pub status: EventStatus,
    /// Present only for converged events
    pub fit: Option<FitResult>,
    /// Reason for the exclusion
    pub error: Option<String>,
}

impl EventOutcome {
    pub fn converged(fit: FitResult) -> Self {
        Self {
            status: EventStatus::Converged,
            fit: Some(fit),
            error: None,
        }
    }

    pub fn excluded(status: EventStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            fit: None,
            error: Some(reason.into()),
        }
    }
}

/// Site amplification of one station with the spread of the per-event
/// estimates it was pooled from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SiteEstimate {
    pub amplification: f64,
    /// Standard deviation of the per-event log estimates
    pub log_spread: Option<f64>,
    /// Number of envelopes that contributed
    pub envelopes: usize,
}

/// Mean, median and standard deviation of one parameter over events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct Spread {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std_dev: Option<f64>,
}

impl Spread {
    pub fn of(values: &[f64]) -> Self {
        Self {
            mean: stats::mean(values),
            median: stats::median(values),
            std_dev: stats::std_dev(values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct BandSummary {
    pub events: usize,
    pub converged: usize,
    /// Over converged events with finite Q
    pub quality_factor: Spread,
    pub scattering: Spread,
    pub misfit: Option<f64>,
}

impl BandSummary {
    pub fn from_outcomes(outcomes: &BTreeMap<String, EventOutcome>) -> Self {
        let fits: Vec<&FitResult> = outcomes.values().filter_map(|o| o.fit.as_ref()).collect();
        let qs: Vec<f64> = fits
            .iter()
            .map(|f| f.quality_factor)
            .filter(|q| q.is_finite())
            .collect();
        let g0: Vec<f64> = fits.iter().map(|f| f.params.scattering).collect();
        let misfits: Vec<f64> = fits.iter().map(|f| f.misfit).collect();
        Self {
            events: outcomes.len(),
            converged: fits.len(),
            quality_factor: Spread::of(&qs),
            scattering: Spread::of(&g0),
            misfit: stats::mean(&misfits),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandResult {
    pub band: FrequencyBand,
    pub events: BTreeMap<String, EventOutcome>,
    pub sites: BTreeMap<String, SiteEstimate>,
    pub summary: BandSummary,
    pub exclusions: Vec<Exclusion>,
}

impl BandResult {
    pub fn site_table(&self) -> SiteTable {
        let mut table = SiteTable::new();
        for (station, estimate) in &self.sites {
            table.set(station.clone(), estimate.amplification);
        }
        table
    }

    pub fn fits(&self) -> impl Iterator<Item = &FitResult> {
        self.events.values().filter_map(|o| o.fit.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    SourceEnergy,
    QualityFactor,
    IntrinsicAttenuation,
    Scattering,
    Spreading,
    SiteAmplification,
    Misfit,
}

/// One value of the flat report. Event-level rows carry no station,
/// site rows carry no event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub event_id: Option<String>,
    pub band: FrequencyBand,
    pub station: Option<String>,
    pub parameter: Parameter,
    pub value: f64,
    pub uncertainty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InversionReport {
    /// Bands that produced results; exhausted bands only appear in `convergence`
    pub band_results: Vec<BandResult>,
    pub convergence: Vec<ConvergenceReport>,
}

impl InversionReport {
    pub fn band(&self, band: &FrequencyBand) -> Option<&BandResult> {
        self.band_results.iter().find(|r| r.band == *band)
    }

    pub fn convergence_for(&self, band: &FrequencyBand) -> Option<&ConvergenceReport> {
        self.convergence.iter().find(|c| c.band == *band)
    }

    /// Outcomes of one event over all bands.
    pub fn event<'a>(
        &'a self,
        event_id: &'a str,
    ) -> impl Iterator<Item = (&'a FrequencyBand, &'a EventOutcome)> + 'a {
        self.band_results
            .iter()
            .filter_map(move |r| r.events.get(event_id).map(|o| (&r.band, o)))
    }

    /// Site amplification of one station in every band it was resolved in.
    pub fn site(&self, station: &str) -> Vec<(FrequencyBand, f64)> {
        self.band_results
            .iter()
            .filter_map(|r| r.sites.get(station).map(|s| (r.band, s.amplification)))
            .collect()
    }

    pub fn site_amplifications(&self) -> Vec<(FrequencyBand, SiteTable)> {
        self.band_results
            .iter()
            .map(|r| (r.band, r.site_table()))
            .collect()
    }

    pub fn rows(&self) -> Vec<ReportRow> {
        let mut rows = Vec::new();
        for result in &self.band_results {
            for (event_id, outcome) in &result.events {
                let Some(fit) = &outcome.fit else {
                    continue;
                };
                let u = &fit.uncertainty;
                let values = [
                    (Parameter::SourceEnergy, fit.params.source_energy, u.source_energy),
                    (Parameter::QualityFactor, fit.quality_factor, u.quality_factor),
                    (Parameter::IntrinsicAttenuation, fit.params.intrinsic, u.intrinsic),
                    (Parameter::Scattering, fit.params.scattering, u.scattering),
                    (Parameter::Spreading, fit.params.spreading, u.spreading),
                    (Parameter::Misfit, fit.misfit, None),
                ];
                rows.extend(values.into_iter().map(|(parameter, value, uncertainty)| {
                    ReportRow {
                        event_id: Some(event_id.clone()),
                        band: result.band,
                        station: None,
                        parameter,
                        value,
                        uncertainty,
                    }
                }));
            }
            for (station, site) in &result.sites {
                rows.push(ReportRow {
                    event_id: None,
                    band: result.band,
                    station: Some(station.clone()),
                    parameter: Parameter::SiteAmplification,
                    value: site.amplification,
                    uncertainty: site.log_spread.map(|s| site.amplification * s),
                });
            }
        }
        rows
    }
}
