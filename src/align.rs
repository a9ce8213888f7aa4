//! Site-response alignment across independent runs
//!
//! Every run of the coupled inversion fixes the source/site scale ambiguity
//! on its own. When several runs share stations, one log factor per run is
//! chosen by least squares so that a shared station gets the same response
//! in every run. The system is pinned either by a reference station or by
//! the mean log site response. Only the largest connected group of runs,
//! linked through shared stations, can be aligned.
//!
//! Applying factor `f` to a run multiplies its site amplifications by `f`
//! and divides its source energies by `f`, leaving predictions unchanged.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::band::FrequencyBand;
use crate::config::SiteNormalization;
use crate::report::{BandResult, InversionReport};
use crate::Error;

const SVD_EPS: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentSummary {
    pub band: FrequencyBand,
    /// Factor applied to each run; `None` for runs outside the aligned area
    pub factors: Vec<Option<f64>>,
    /// Stations in the aligned area
    pub stations: usize,
    /// Number of unconnected areas found
    pub areas: usize,
}

/// Disjoint sets over run indices.
struct Areas {
    parent: Vec<usize>,
}

impl Areas {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

struct Row {
    coefficients: Vec<(usize, f64)>,
    rhs: f64,
}

/// Align the results of one band from several runs in place.
pub fn align_band_results(
    results: &mut [&mut BandResult],
    normalization: &SiteNormalization,
) -> Result<AlignmentSummary, Error> {
    let Some(first) = results.first() else {
        return Err(Error::Alignment("no band results to align".to_string()));
    };
    let band = first.band;
    if results.iter().any(|r| r.band != band) {
        return Err(Error::Alignment(format!(
            "results of different bands cannot be aligned with {band}"
        )));
    }

    // (run, ln R) per station, in run order
    let mut station_runs: BTreeMap<&str, Vec<(usize, f64)>> = BTreeMap::new();
    for (k, result) in results.iter().enumerate() {
        for (station, site) in &result.sites {
            if site.amplification.is_finite() && site.amplification > 0.0 {
                station_runs
                    .entry(station.as_str())
                    .or_default()
                    .push((k, site.amplification.ln()));
            }
        }
    }

    let mut areas = Areas::new(results.len());
    for runs in station_runs.values() {
        for pair in runs.windows(2) {
            areas.union(pair[0].0, pair[1].0);
        }
    }
    let mut area_stations: BTreeMap<usize, usize> = BTreeMap::new();
    for runs in station_runs.values() {
        if let Some(&(k, _)) = runs.first() {
            *area_stations.entry(areas.find(k)).or_default() += 1;
        }
    }
    // Largest by station count, lowest root on ties.
    let Some((&root, &stations)) = area_stations
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
    else {
        return Err(Error::Alignment(format!("no site responses in band {band}")));
    };
    tracing::info!(%band, areas = area_stations.len(), stations, "aligning largest area");

    let columns: Vec<usize> = (0..results.len())
        .filter(|&k| areas.find(k) == root)
        .collect();
    let column_of = |k: usize| columns.iter().position(|&c| c == k);
    let in_area: Vec<(&str, &Vec<(usize, f64)>)> = station_runs
        .iter()
        .filter(|(_, runs)| runs.first().is_some_and(|&(k, _)| areas.find(k) == root))
        .map(|(s, runs)| (*s, runs))
        .collect();

    let mut rows = Vec::new();
    let mut norm = vec![0.0; columns.len()];
    let mut norm_rhs = 0.0;
    let mut pinned = false;
    for &(station, runs) in &in_area {
        let reference = match normalization {
            SiteNormalization::ReferenceStation {
                station: reference,
                response,
            } if reference.as_str() == station => Some(response.ln()),
            _ => None,
        };
        if let Some(ln_response) = reference {
            pinned = true;
            for &(k, ln_r) in runs.iter() {
                if let Some(c) = column_of(k) {
                    rows.push(Row {
                        coefficients: vec![(c, 1.0)],
                        rhs: ln_response - ln_r,
                    });
                }
            }
            continue;
        }
        for pair in runs.windows(2) {
            let ((kl, ln_rl), (k, ln_r)) = (pair[0], pair[1]);
            if let (Some(cl), Some(c)) = (column_of(kl), column_of(k)) {
                rows.push(Row {
                    coefficients: vec![(c, 1.0), (cl, -1.0)],
                    rhs: ln_rl - ln_r,
                });
            }
        }
        let weight = 1.0 / (runs.len() * in_area.len()) as f64;
        for &(k, ln_r) in runs.iter() {
            if let Some(c) = column_of(k) {
                norm[c] += weight;
                norm_rhs -= ln_r * weight;
            }
        }
    }

    match normalization {
        SiteNormalization::GeometricMean { response } => {
            rows.push(Row {
                coefficients: norm.iter().copied().enumerate().collect(),
                rhs: norm_rhs + response.ln(),
            });
        }
        SiteNormalization::ReferenceStation { station, .. } if !pinned => {
            return Err(Error::Alignment(format!(
                "reference station {station} is not part of the aligned area in band {band}"
            )));
        }
        SiteNormalization::ReferenceStation { .. } => {}
    }

    let mut a = DMatrix::zeros(rows.len(), columns.len());
    let mut b = DVector::zeros(rows.len());
    for (i, row) in rows.iter().enumerate() {
        for &(c, value) in &row.coefficients {
            a[(i, c)] = value;
        }
        b[i] = row.rhs;
    }
    tracing::debug!(%band, rows = rows.len(), runs = columns.len(), "alignment system built");
    let log_factors = a
        .svd(true, true)
        .solve(&b, SVD_EPS)
        .map_err(|e| Error::Alignment(e.to_string()))?;

    let mut factors = vec![None; results.len()];
    for (c, &k) in columns.iter().enumerate() {
        let factor = log_factors[c].exp();
        rescale(results[k], factor);
        factors[k] = Some(factor);
    }

    Ok(AlignmentSummary {
        band,
        factors,
        stations,
        areas: area_stations.len(),
    })
}

fn rescale(result: &mut BandResult, factor: f64) {
    for site in result.sites.values_mut() {
        site.amplification *= factor;
    }
    for outcome in result.events.values_mut() {
        if let Some(fit) = outcome.fit.as_mut() {
            fit.params.source_energy /= factor;
            if let Some(sigma) = fit.uncertainty.source_energy.as_mut() {
                *sigma /= factor;
            }
            for sta in &mut fit.station_residuals {
                sta.site_amplification *= factor;
            }
        }
    }
}

/// Align every band shared by several reports.
pub fn align_site_responses(
    reports: &mut [InversionReport],
    normalization: &SiteNormalization,
) -> Result<Vec<AlignmentSummary>, Error> {
    let mut by_band: Vec<(FrequencyBand, Vec<&mut BandResult>)> = Vec::new();
    for report in reports.iter_mut() {
        for result in report.band_results.iter_mut() {
            let band = result.band;
            match by_band.iter().position(|(b, _)| *b == band) {
                Some(i) => by_band[i].1.push(result),
                None => by_band.push((band, vec![result])),
            }
        }
    }

    by_band
        .into_iter()
        .map(|(_, mut group)| align_band_results(&mut group, normalization))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inversion::{FitResult, ParameterUncertainty, StationResidual};
    use crate::params::EventParams;
    use crate::report::{BandSummary, EventOutcome, SiteEstimate};
    use approx::assert_relative_eq;

    fn run(sites: &[(&str, f64)], source_energy: f64) -> BandResult {
        let band = FrequencyBand::octave(3.0);
        let fit = FitResult {
            event_id: "e".to_string(),
            band,
            params: EventParams::new(source_energy, 0.1, 0.01, 1.0),
            quality_factor: 190.0,
            uncertainty: ParameterUncertainty::default(),
            station_residuals: sites
                .iter()
                .map(|&(s, r)| StationResidual {
                    station: s.to_string(),
                    site_amplification: r,
                    mean_residual: 0.0,
                    samples: 10,
                })
                .collect(),
            residuals: Vec::new(),
            misfit: 0.0,
            iterations: 4,
            converged: true,
        };
        let mut events = BTreeMap::new();
        events.insert("e".to_string(), EventOutcome::converged(fit));
        BandResult {
            band,
            sites: sites
                .iter()
                .map(|&(s, r)| {
                    (
                        s.to_string(),
                        SiteEstimate {
                            amplification: r,
                            log_spread: None,
                            envelopes: 1,
                        },
                    )
                })
                .collect(),
            summary: BandSummary::from_outcomes(&events),
            events,
            exclusions: Vec::new(),
        }
    }

    fn source(result: &BandResult) -> f64 {
        result.events["e"].fit.as_ref().unwrap().params.source_energy
    }

    #[test]
    fn shared_stations_agree_after_alignment() {
        let mut a = run(&[("A", 1.0), ("B", 2.0), ("C", 0.5)], 100.0);
        let mut b = run(&[("B", 6.0), ("C", 1.5), ("D", 3.0)], 100.0 / 3.0);
        let summary = align_band_results(
            &mut [&mut a, &mut b],
            &SiteNormalization::GeometricMean { response: 1.0 },
        )
        .unwrap();

        assert_eq!(summary.areas, 1);
        assert_eq!(summary.stations, 4);
        assert_relative_eq!(a.sites["B"].amplification, b.sites["B"].amplification, max_relative = 1e-9);
        assert_relative_eq!(a.sites["C"].amplification, b.sites["C"].amplification, max_relative = 1e-9);
        // W R is invariant.
        assert_relative_eq!(source(&a) * a.sites["A"].amplification, 100.0, max_relative = 1e-9);
        assert_relative_eq!(source(&b) * b.sites["D"].amplification, 100.0, max_relative = 1e-9);
        let fa = summary.factors[0].unwrap();
        let fb = summary.factors[1].unwrap();
        assert_relative_eq!(fb / fa, 1.0 / 3.0, max_relative = 1e-9);
    }

    #[test]
    fn reference_station_is_pinned() {
        let mut a = run(&[("A", 1.0), ("B", 2.0)], 10.0);
        let mut b = run(&[("B", 4.0), ("C", 1.0)], 5.0);
        let normalization = SiteNormalization::ReferenceStation {
            station: "B".to_string(),
            response: 1.0,
        };
        align_band_results(&mut [&mut a, &mut b], &normalization).unwrap();
        assert_relative_eq!(a.sites["B"].amplification, 1.0, max_relative = 1e-9);
        assert_relative_eq!(b.sites["B"].amplification, 1.0, max_relative = 1e-9);
        assert_relative_eq!(a.sites["A"].amplification, 0.5, max_relative = 1e-9);
        assert_relative_eq!(source(&a), 20.0, max_relative = 1e-9);
    }

    #[test]
    fn unconnected_run_is_left_alone() {
        let mut a = run(&[("A", 1.0), ("B", 2.0)], 10.0);
        let mut b = run(&[("B", 4.0), ("C", 1.0)], 5.0);
        let mut lone = run(&[("Z", 7.0)], 1.0);
        let summary = align_band_results(
            &mut [&mut a, &mut b, &mut lone],
            &SiteNormalization::default(),
        )
        .unwrap();
        assert_eq!(summary.areas, 2);
        assert!(summary.factors[2].is_none());
        assert_eq!(lone.sites["Z"].amplification, 7.0);
    }

    #[test]
    fn missing_reference_station_is_an_error() {
        let mut a = run(&[("A", 1.0)], 1.0);
        let err = align_band_results(
            &mut [&mut a],
            &SiteNormalization::ReferenceStation {
                station: "X".to_string(),
                response: 1.0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Alignment(_)));
    }

    #[test]
    fn reports_are_grouped_by_band() {
        let mut reports = vec![
            InversionReport {
                band_results: vec![run(&[("A", 1.0), ("B", 2.0)], 10.0)],
                convergence: Vec::new(),
            },
            InversionReport {
                band_results: vec![run(&[("B", 4.0), ("C", 1.0)], 5.0)],
                convergence: Vec::new(),
            },
        ];
        let summaries =
            align_site_responses(&mut reports, &SiteNormalization::default()).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].factors.len(), 2);
        assert_relative_eq!(
            reports[0].band_results[0].sites["B"].amplification,
            reports[1].band_results[0].sites["B"].amplification,
            max_relative = 1e-9
        );
    }
}
