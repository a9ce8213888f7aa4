//! Coupling Iterator
//!
//! Site amplification is the only quantity shared between the events of a
//! band. The iterator alternates two steps until the site terms stop
//! moving:
//!
//! 1. fit every event with the site table held fixed (in parallel, the table
//!    is a read-only snapshot)
//! 2. pool the per-event residuals of each station into a new site term
//!
//! Once the site terms settle, envelopes that disagree with their station's
//! pooled term are rejected and the events are fitted again.
//!
//! The loop is an explicit state machine so each transition can be driven
//! and inspected on its own.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::Serialize;

use super::event::{invert_event, FitResult, InitialGuess, InversionError};
use crate::band::FrequencyBand;
use crate::config::{InversionConfig, SiteAggregation};
use crate::dataset::Dataset;
use crate::envelope::Envelope;
use crate::params::SiteTable;
use crate::quality;
use crate::report::{
    BandResult, BandSummary, EventOutcome, EventStatus, InversionReport, SiteEstimate,
};
use crate::stats;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingState {
    Initializing,
    FittingEvents,
    UpdatingSiteTerms,
    Converged,
    Failed,
}

impl CouplingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Failed)
    }
}

/// Why the loop of one band stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Site terms changed less than the tolerance
    Converged,
    /// Coupling budget spent; the results of the last pass are kept
    MaxIterations,
    /// No event produced a fit
    DatasetExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassSummary {
    pub pass: usize,
    pub fitted: usize,
    pub failed: usize,
    /// Envelopes removed by the residual post-pass
    pub rejected: usize,
    /// Largest absolute change of a log site term
    pub max_site_change: f64,
    /// Sum of squared log residuals over the fitted events
    pub residual_norm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub band: FrequencyBand,
    pub state: CouplingState,
    pub termination: Termination,
    pub passes: Vec<PassSummary>,
    pub site_terms_converged: bool,
}

/// Log site term of one station pooled over the envelopes of a pass.
#[derive(Debug, Clone, Copy)]
struct PooledSite {
    log_site: f64,
    spread: Option<f64>,
    envelopes: usize,
}

impl ConvergenceReport {
    pub fn iterations(&self) -> usize {
        self.passes.len()
    }
}

pub struct CouplingIterator<'c> {
    config: &'c InversionConfig,
    band: FrequencyBand,
    dataset: Dataset,
    state: CouplingState,
    /// Every event the band started with, including ones that never got an
    /// envelope through the builder
    event_ids: BTreeSet<String>,
    sites: SiteTable,
    site_spread: BTreeMap<String, (Option<f64>, usize)>,
    fits: BTreeMap<String, FitResult>,
    failures: BTreeMap<String, InversionError>,
    /// Last successful parameters per event, used as warm starts
    seeds: BTreeMap<String, InitialGuess>,
    passes: Vec<PassSummary>,
    termination: Option<Termination>,
}

impl<'c> CouplingIterator<'c> {
    pub fn new(dataset: Dataset, config: &'c InversionConfig) -> Self {
        let event_ids = dataset
            .events()
            .keys()
            .cloned()
            .chain(dataset.exclusions().iter().map(|x| x.event_id.clone()))
            .collect();
        Self {
            config,
            band: *dataset.band(),
            dataset,
            state: CouplingState::Initializing,
            event_ids,
            sites: SiteTable::new(),
            site_spread: BTreeMap::new(),
            fits: BTreeMap::new(),
            failures: BTreeMap::new(),
            seeds: BTreeMap::new(),
            passes: Vec::new(),
            termination: None,
        }
    }

    pub fn state(&self) -> CouplingState {
        self.state
    }

    pub fn band(&self) -> &FrequencyBand {
        &self.band
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn sites(&self) -> &SiteTable {
        &self.sites
    }

    pub fn fits(&self) -> &BTreeMap<String, FitResult> {
        &self.fits
    }

    pub fn passes(&self) -> &[PassSummary] {
        &self.passes
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Perform one transition. Terminal states are left unchanged.
    pub fn step(&mut self) -> CouplingState {
        self.state = match self.state {
            CouplingState::Initializing => self.initialize(),
            CouplingState::FittingEvents => self.fit_events(),
            CouplingState::UpdatingSiteTerms => self.update_site_terms(),
            terminal => terminal,
        };
        self.state
    }

    /// Step until a terminal state is reached.
    pub fn run(&mut self) -> CouplingState {
        while !self.state.is_terminal() {
            self.step();
        }
        self.state
    }

    fn fail(&mut self) -> CouplingState {
        self.termination = Some(Termination::DatasetExhausted);
        tracing::warn!(band = %self.band, passes = self.passes.len(), "dataset exhausted");
        CouplingState::Failed
    }

    fn initialize(&mut self) -> CouplingState {
        quality::pre_pass(&mut self.dataset);
        self.sites = SiteTable::neutral(self.dataset.stations());
        tracing::debug!(
            band = %self.band,
            events = self.dataset.event_count(),
            stations = self.sites.len(),
            "coupling initialized"
        );
        if self.dataset.is_empty() {
            return self.fail();
        }
        CouplingState::FittingEvents
    }

    fn fit_events(&mut self) -> CouplingState {
        let config = self.config;
        let band = self.band;
        let sites = &self.sites;
        let seeds = &self.seeds;
        let fit_one = |(event_id, envelopes): (&String, &Vec<Envelope>)| {
            let guess = seeds
                .get(event_id)
                .copied()
                .unwrap_or_else(|| InitialGuess::from_config(config));
            (
                event_id.clone(),
                invert_event(envelopes, &band, sites, &guess, config),
            )
        };
        let results: Vec<(String, Result<FitResult, InversionError>)> = if config.parallel {
            self.dataset.events().par_iter().map(fit_one).collect()
        } else {
            self.dataset.events().iter().map(fit_one).collect()
        };

        self.fits.clear();
        self.failures.clear();
        for (event_id, result) in results {
            match result {
                Ok(fit) => {
                    self.seeds
                        .insert(event_id.clone(), InitialGuess::from_params(&fit.params));
                    self.fits.insert(event_id, fit);
                }
                Err(err) => {
                    tracing::debug!(band = %band, "{err}");
                    self.failures.insert(event_id, err);
                }
            }
        }

        let pass = self.passes.len() + 1;
        let residual_norm: f64 = self
            .fits
            .values()
            .flat_map(|f| f.residuals.iter())
            .map(|r| r * r)
            .sum();
        self.passes.push(PassSummary {
            pass,
            fitted: self.fits.len(),
            failed: self.failures.len(),
            rejected: 0,
            max_site_change: 0.0,
            residual_norm,
        });
        tracing::debug!(
            band = %band,
            pass,
            fitted = self.fits.len(),
            failed = self.failures.len(),
            residual_norm,
            "events fitted"
        );

        if self.fits.is_empty() {
            return self.fail();
        }
        CouplingState::UpdatingSiteTerms
    }

    /// Pool the residual-implied log amplification of every station over
    /// the retained envelopes of fitted events.
    fn pool_site_terms(&self) -> BTreeMap<String, PooledSite> {
        let mut estimates: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (event_id, envelopes) in self.dataset.events() {
            let Some(fit) = self.fits.get(event_id) else {
                continue;
            };
            for envelope in envelopes {
                if let Some(sta) = fit.station(envelope.station()) {
                    estimates
                        .entry(sta.station.clone())
                        .or_default()
                        .push(sta.site_amplification.ln() + sta.mean_residual);
                }
            }
        }

        estimates
            .into_iter()
            .filter_map(|(station, logs)| {
                let log_site = match self.config.site_aggregation {
                    SiteAggregation::Median => stats::median(&logs),
                    SiteAggregation::Mean => stats::mean(&logs),
                    SiteAggregation::TrimmedMean(fraction) => stats::trimmed_mean(&logs, fraction),
                }?;
                let spread = (logs.len() > 1).then(|| stats::std_dev(&logs)).flatten();
                Some((
                    station,
                    PooledSite {
                        log_site,
                        spread,
                        envelopes: logs.len(),
                    },
                ))
            })
            .collect()
    }

    /// Normalized site table over the pooled stations only and its largest
    /// log change against the current table.
    fn site_table(&self, pooled: &BTreeMap<String, PooledSite>) -> (SiteTable, f64) {
        let mut table = SiteTable::new();
        for (station, site) in pooled {
            table.set(station.clone(), site.log_site.exp());
        }
        table.normalize(&self.config.site_normalization);
        let change = table.max_log_change(&self.sites);
        (table, change)
    }

    fn update_site_terms(&mut self) -> CouplingState {
        let pass = self.passes.len();
        let mut pooled = self.pool_site_terms();
        let (mut updated, change) = self.site_table(&pooled);

        // Outliers are only judged against settled site terms.
        let settled = change <= self.config.site_tolerance;
        let mut rejected = 0;
        if settled {
            let logs: BTreeMap<String, f64> = pooled
                .iter()
                .map(|(station, site)| (station.clone(), site.log_site))
                .collect();
            rejected = quality::post_pass(&mut self.dataset, &self.fits, &logs, self.config, pass);
            if rejected > 0 {
                pooled = self.pool_site_terms();
                updated = self.site_table(&pooled).0;
            }
        }

        let dropped = self.sites.len().saturating_sub(updated.len());
        if dropped > 0 {
            tracing::debug!(band = %self.band, pass, dropped, "stations without site estimate");
        }
        self.sites = updated;
        self.site_spread = pooled
            .into_iter()
            .map(|(station, site)| (station, (site.spread, site.envelopes)))
            .collect();
        if let Some(summary) = self.passes.last_mut() {
            summary.rejected = rejected;
            summary.max_site_change = change;
        }
        tracing::debug!(band = %self.band, pass, change, rejected, "site terms updated");

        if settled && rejected == 0 {
            self.termination = Some(Termination::Converged);
            tracing::info!(band = %self.band, passes = pass, "site terms converged");
            CouplingState::Converged
        } else if pass >= self.config.max_coupling_iterations {
            self.termination = Some(Termination::MaxIterations);
            tracing::warn!(
                band = %self.band,
                passes = pass,
                change,
                rejected,
                "coupling budget spent before site terms settled"
            );
            CouplingState::Converged
        } else {
            CouplingState::FittingEvents
        }
    }

    pub fn convergence_report(&self) -> ConvergenceReport {
        let termination = self.termination.unwrap_or(Termination::MaxIterations);
        ConvergenceReport {
            band: self.band,
            state: self.state,
            termination,
            passes: self.passes.clone(),
            site_terms_converged: termination == Termination::Converged,
        }
    }

    /// Final band result, `None` unless the iterator converged.
    pub fn band_result(&self) -> Option<BandResult> {
        if self.state != CouplingState::Converged {
            return None;
        }

        let mut events = BTreeMap::new();
        for event_id in &self.event_ids {
            let outcome = if let Some(fit) = self.fits.get(event_id) {
                EventOutcome::converged(fit.clone())
            } else if let Some(err) = self.failures.get(event_id) {
                let status = if err.is_insufficient_data() {
                    EventStatus::ExcludedInsufficientData
                } else {
                    EventStatus::ExcludedNonConvergent
                };
                EventOutcome::excluded(status, err.to_string())
            } else {
                EventOutcome::excluded(
                    EventStatus::ExcludedInsufficientData,
                    "every envelope of the event was excluded",
                )
            };
            events.insert(event_id.clone(), outcome);
        }

        let sites = self
            .sites
            .iter()
            .map(|(station, amplification)| {
                let (log_spread, envelopes) =
                    self.site_spread.get(station).copied().unwrap_or((None, 0));
                (
                    station.to_string(),
                    SiteEstimate {
                        amplification,
                        log_spread,
                        envelopes,
                    },
                )
            })
            .collect();

        let summary = BandSummary::from_outcomes(&events);
        Some(BandResult {
            band: self.band,
            events,
            sites,
            summary,
            exclusions: self.dataset.exclusions().to_vec(),
        })
    }
}

/// Samples of an event above the noise floor. SNR flags and station
/// minimums are data problems, not structural ones, and are ignored here.
fn fittable_samples(envelopes: &[Envelope], config: &InversionConfig) -> usize {
    envelopes
        .iter()
        .map(|e| e.fit_samples(config.noise_floor_factor).count())
        .sum()
}

/// Reject a run in which no event of any band could ever be fitted because
/// there are more unknowns than data points.
fn check_structure(datasets: &[Dataset], config: &InversionConfig) -> Result<(), Error> {
    let unknowns = config.free_parameter_count();
    let mut events = 0;
    for dataset in datasets {
        for envelopes in dataset.events().values() {
            events += 1;
            if fittable_samples(envelopes, config) >= unknowns {
                return Ok(());
            }
        }
    }
    if events == 0 {
        return Ok(());
    }
    Err(Error::ConfigContradiction(format!(
        "{unknowns} free parameters exceed the usable samples of all {events} events"
    )))
}

fn run_band(dataset: Dataset, config: &InversionConfig) -> (Option<BandResult>, ConvergenceReport) {
    let mut iterator = CouplingIterator::new(dataset, config);
    iterator.run();
    let report = iterator.convergence_report();
    let result = iterator.band_result();
    if let Some(result) = &result {
        tracing::info!(
            band = %result.band,
            converged = result.summary.converged,
            events = result.summary.events,
            passes = report.iterations(),
            "band inverted"
        );
    }
    (result, report)
}

/// Invert every band independently.
///
/// Failed bands have no entry in `band_results`; their convergence report
/// says why. Only an invalid or contradictory configuration fails the run.
pub fn run_coupled_inversion(
    datasets: Vec<Dataset>,
    config: &InversionConfig,
) -> Result<InversionReport, Error> {
    config.validate()?;
    check_structure(&datasets, config)?;

    let outcomes: Vec<(Option<BandResult>, ConvergenceReport)> = if config.parallel {
        datasets
            .into_par_iter()
            .map(|dataset| run_band(dataset, config))
            .collect()
    } else {
        datasets
            .into_iter()
            .map(|dataset| run_band(dataset, config))
            .collect()
    };

    let mut report = InversionReport {
        band_results: Vec::with_capacity(outcomes.len()),
        convergence: Vec::with_capacity(outcomes.len()),
    };
    for (result, convergence) in outcomes {
        report.band_results.extend(result);
        report.convergence.push(convergence);
    }
    Ok(report)
}
