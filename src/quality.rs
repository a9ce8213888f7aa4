//! Quality/Outlier Filter
//!
//! The only code allowed to shrink a [`Dataset`]. The pre-pass removes
//! envelopes the builder flagged as unusable; the post-pass removes
//! envelopes whose site estimate disagrees with the pooled estimate of
//! their station.

use std::collections::BTreeMap;

use crate::config::{InversionConfig, OutlierRule};
use crate::dataset::{Dataset, ExclusionReason};
use crate::inversion::FitResult;
use crate::stats::{self, MAD_TO_SIGMA};

/// Lower bound on the spread (log units) used to scale deviations.
const MIN_SPREAD: f64 = 1e-6;

/// Drop envelopes whose signal-to-noise ratio failed the threshold.
pub fn pre_pass(dataset: &mut Dataset) -> usize {
    let removed = dataset.remove_where(|e| {
        (!e.is_usable()).then(|| ExclusionReason::LowSnr { snr: e.snr() })
    });
    if removed > 0 {
        tracing::debug!(band = %dataset.band(), removed, "low-SNR envelopes excluded");
    }
    removed
}

/// Deviation of each residual from the center in units of the spread, for
/// residuals beyond `threshold` spreads; `None` for the rest.
///
/// The spread is floored at `min_spread`, so identical residuals are never
/// flagged while a single departure from otherwise identical values is.
fn outlier_scores(
    residuals: &[f64],
    rule: OutlierRule,
    threshold: f64,
    min_spread: f64,
) -> Vec<Option<f64>> {
    let center_spread = match rule {
        OutlierRule::Mad => {
            stats::median_abs_deviation(residuals).map(|(med, mad)| (med, MAD_TO_SIGMA * mad))
        }
        OutlierRule::StdDev => stats::mean(residuals).zip(stats::std_dev(residuals)),
    };
    let Some((center, spread)) = center_spread else {
        return vec![None; residuals.len()];
    };
    let spread = spread.max(min_spread).max(MIN_SPREAD);
    residuals
        .iter()
        .map(|r| {
            let score = (r - center).abs() / spread;
            (score > threshold).then_some(score)
        })
        .collect()
}

/// Flag residuals farther than `threshold` robust spreads from the center.
pub fn flag_outliers(
    residuals: &[f64],
    rule: OutlierRule,
    threshold: f64,
    min_spread: f64,
) -> Vec<bool> {
    outlier_scores(residuals, rule, threshold, min_spread)
        .into_iter()
        .map(|score| score.is_some())
        .collect()
}

/// Remove envelopes whose residual-implied log site term departs from the
/// pooled estimate of their station.
///
/// `pooled` holds the log site term of every station as aggregated over the
/// same envelopes. An outlier biases the fit of its whole event, so at most
/// the worst envelope of each event is removed per pass; the rest of the
/// event is judged again after its refit. Envelopes of events without a fit
/// this pass are kept. Deviations are scaled by at least `site_tolerance`.
pub fn post_pass(
    dataset: &mut Dataset,
    fits: &BTreeMap<String, FitResult>,
    pooled: &BTreeMap<String, f64>,
    config: &InversionConfig,
    pass: usize,
) -> usize {
    let mut keys = Vec::new();
    let mut residuals = Vec::new();
    for (event_id, envelopes) in dataset.events() {
        let Some(fit) = fits.get(event_id) else {
            continue;
        };
        for envelope in envelopes {
            let Some(sta) = fit.station(envelope.station()) else {
                continue;
            };
            let Some(&ln_site) = pooled.get(&sta.station) else {
                continue;
            };
            keys.push((event_id.clone(), sta.station.clone()));
            residuals.push(sta.site_amplification.ln() + sta.mean_residual - ln_site);
        }
    }

    let scores = outlier_scores(
        &residuals,
        config.outlier_rule,
        config.outlier_threshold,
        config.site_tolerance,
    );
    // Worst flagged envelope per event: (station, residual, score)
    let mut worst: BTreeMap<String, (String, f64, f64)> = BTreeMap::new();
    for (((event_id, station), residual), score) in keys.into_iter().zip(residuals).zip(scores) {
        let Some(score) = score else {
            continue;
        };
        let replace = worst.get(&event_id).map_or(true, |&(_, _, s)| score > s);
        if replace {
            worst.insert(event_id, (station, residual, score));
        }
    }
    if worst.is_empty() {
        return 0;
    }

    let removed = dataset.remove_where(|e| {
        worst
            .get(e.event_id())
            .filter(|(station, _, _)| station == e.station())
            .map(|&(_, residual, _)| ExclusionReason::Outlier { residual, pass })
    });
    tracing::info!(band = %dataset.band(), pass, removed, "outlier envelopes excluded");
    removed
}
