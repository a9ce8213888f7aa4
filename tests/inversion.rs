use approx::assert_relative_eq;
use coda_envelope::synthetic::{
    synthetic_dataset, synthetic_envelopes, SyntheticConfig, SyntheticEvent, SyntheticStation,
};
use coda_envelope::{
    align_site_responses, invert_event, run_coupled_inversion, Dataset, EventParams, EventStatus,
    ExclusionReason, FrequencyBand, InitialGuess, InversionConfig, InversionError, ParameterMode,
    ScatteringModel, SiteAggregation, SiteNormalization, SiteTable,
};

fn event(id: &str, source_energy: f64, stations: &[(&str, f64, f64)]) -> SyntheticEvent {
    SyntheticEvent {
        id: id.to_string(),
        source_energy,
        stations: stations
            .iter()
            .map(|&(name, r, site)| SyntheticStation::new(name, r, site))
            .collect(),
    }
}

fn linear_config() -> InversionConfig {
    InversionConfig {
        scattering: ParameterMode::Fixed(0.0),
        geometric_spreading: ParameterMode::Fixed(1.0),
        ..InversionConfig::default()
    }
}

/// Three stations, Q = 200 at 10 Hz, no scattering, n = 1.
fn scenario() -> (SyntheticConfig, Dataset) {
    let band = FrequencyBand::octave(10.0);
    let synth = SyntheticConfig {
        band,
        intrinsic: EventParams::intrinsic_from_q(200.0, band.center()),
        scattering: 0.0,
        spreading: 1.0,
        ..SyntheticConfig::default()
    };
    let ev = event(
        "2024-01-01T00:00",
        3e7,
        &[("A", 10.0, 1.0), ("B", 20.0, 1.0), ("C", 40.0, 1.0)],
    );
    let dataset = synthetic_dataset(&[ev], &synth).unwrap();
    (synth, dataset)
}

#[test]
fn three_station_scenario_recovers_q_and_unit_sites() {
    let (synth, dataset) = scenario();
    let config = InversionConfig {
        bands: vec![synth.band],
        ..linear_config()
    };
    let envelopes = dataset.event("2024-01-01T00:00").unwrap();

    let fit = invert_event(
        envelopes,
        &synth.band,
        &SiteTable::neutral(["A", "B", "C"]),
        &InitialGuess::from_config(&config),
        &config,
    )
    .unwrap();
    assert!(fit.converged);
    assert_relative_eq!(fit.quality_factor, 200.0, max_relative = 0.02);

    let report = run_coupled_inversion(vec![dataset], &config).unwrap();
    let result = report.band(&synth.band).unwrap();
    assert_eq!(result.summary.converged, 1);
    for station in ["A", "B", "C"] {
        assert_relative_eq!(result.sites[station].amplification, 1.0, max_relative = 0.02);
    }
    assert!(report.convergence[0].site_terms_converged);
}

#[test]
fn single_scattering_round_trip() {
    let band = FrequencyBand::octave(4.0);
    let synth = SyntheticConfig {
        band,
        model: ScatteringModel::SingleScattering,
        intrinsic: EventParams::intrinsic_from_q(150.0, band.center()),
        scattering: 0.02,
        spreading: 1.0,
        ..SyntheticConfig::default()
    };
    let ev = event(
        "ev",
        1e6,
        &[("A", 15.0, 1.0), ("B", 30.0, 1.0), ("C", 60.0, 1.0), ("D", 90.0, 1.0)],
    );
    let dataset = synthetic_dataset(&[ev], &synth).unwrap();
    let mut config = InversionConfig::default();
    config.solver.max_iterations = 500;

    let fit = invert_event(
        dataset.event("ev").unwrap(),
        &band,
        &SiteTable::new(),
        &InitialGuess::from_config(&config),
        &config,
    )
    .unwrap();
    assert_relative_eq!(fit.params.source_energy, 1e6, max_relative = 0.01);
    assert_relative_eq!(fit.params.scattering, 0.02, max_relative = 0.01);
    assert_relative_eq!(fit.quality_factor, 150.0, max_relative = 0.01);
    assert!(fit.uncertainty.quality_factor.is_some());
}

#[test]
fn diffusive_round_trip() {
    let band = FrequencyBand::octave(2.0);
    let synth = SyntheticConfig {
        band,
        model: ScatteringModel::Diffusive,
        intrinsic: EventParams::intrinsic_from_q(100.0, band.center()),
        scattering: 0.05,
        spreading: 1.0,
        duration: 60.0,
        ..SyntheticConfig::default()
    };
    let ev = event(
        "ev",
        1e5,
        &[("A", 20.0, 1.0), ("B", 50.0, 1.0), ("C", 100.0, 1.0), ("D", 150.0, 1.0)],
    );
    let dataset = synthetic_dataset(&[ev], &synth).unwrap();
    let mut config = InversionConfig {
        scattering_model: ScatteringModel::Diffusive,
        initial_scattering: 0.03,
        ..InversionConfig::default()
    };
    config.solver.max_iterations = 500;

    let fit = invert_event(
        dataset.event("ev").unwrap(),
        &band,
        &SiteTable::new(),
        &InitialGuess::from_config(&config),
        &config,
    )
    .unwrap();
    assert_relative_eq!(fit.params.scattering, 0.05, max_relative = 0.01);
    assert_relative_eq!(fit.quality_factor, 100.0, max_relative = 0.01);
}

#[test]
fn below_minimum_stations_is_always_singular() {
    let (synth, dataset) = scenario();
    for required in [4, 5, 10] {
        let config = InversionConfig {
            min_stations: required,
            ..linear_config()
        };
        let err = invert_event(
            dataset.event("2024-01-01T00:00").unwrap(),
            &synth.band,
            &SiteTable::new(),
            &InitialGuess::from_config(&config),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, InversionError::SingularSystem { stations: 3, .. }));
    }

    let config = InversionConfig {
        min_stations: 4,
        ..linear_config()
    };
    let report = run_coupled_inversion(vec![scenario().1], &config).unwrap();
    assert!(report.band_results.is_empty());
}

fn network_synth(band: FrequencyBand, q: f64) -> SyntheticConfig {
    SyntheticConfig {
        band,
        intrinsic: EventParams::intrinsic_from_q(q, band.center()),
        scattering: 0.0,
        spreading: 1.0,
        ..SyntheticConfig::default()
    }
}

/// Five events recorded by every station; `site(event, station)` gives the
/// amplification of each record.
fn network_events(stations: &[&str], site: impl Fn(usize, &str) -> f64) -> Vec<SyntheticEvent> {
    (0..5)
        .map(|k| {
            let placed: Vec<(&str, f64, f64)> = stations
                .iter()
                .enumerate()
                .map(|(j, &name)| {
                    let r = 12.0 + 17.0 * ((j * 3 + k * 2) % 7) as f64;
                    (name, r, site(k, name))
                })
                .collect();
            event(&format!("ev{k}"), 1e5 * (k + 1) as f64, &placed)
        })
        .collect()
}

fn network_dataset(band: FrequencyBand, stations: &[(&str, f64)]) -> Dataset {
    let names: Vec<&str> = stations.iter().map(|&(name, _)| name).collect();
    let events = network_events(&names, |_, name| {
        stations
            .iter()
            .find(|&&(s, _)| s == name)
            .map_or(1.0, |&(_, site)| site)
    });
    synthetic_dataset(&events, &network_synth(band, 250.0)).unwrap()
}

fn coupling_config() -> InversionConfig {
    InversionConfig {
        site_aggregation: SiteAggregation::Mean,
        outlier_threshold: 50.0,
        site_tolerance: 1e-7,
        max_coupling_iterations: 300,
        ..linear_config()
    }
}

#[test]
fn coupled_inversion_recovers_site_terms() {
    let band = FrequencyBand::octave(3.0);
    let sites = [("A", 2.0), ("B", 0.5), ("C", 1.0), ("D", 1.0)];
    let report =
        run_coupled_inversion(vec![network_dataset(band, &sites)], &coupling_config()).unwrap();
    let result = report.band(&band).unwrap();
    for (station, truth) in sites {
        assert_relative_eq!(result.sites[station].amplification, truth, max_relative = 0.02);
    }
    assert!(result
        .events
        .values()
        .all(|o| o.status == EventStatus::Converged));
    assert_relative_eq!(
        result.summary.quality_factor.median.unwrap(),
        250.0,
        max_relative = 0.02
    );
}

#[test]
fn coupled_inversion_is_deterministic() {
    let band = FrequencyBand::octave(3.0);
    let sites = [("A", 1.5), ("B", 0.8), ("C", 1.0), ("D", 0.9)];
    let config = InversionConfig {
        parallel: true,
        ..coupling_config()
    };
    let first = run_coupled_inversion(vec![network_dataset(band, &sites)], &config).unwrap();
    let second = run_coupled_inversion(vec![network_dataset(band, &sites)], &config).unwrap();
    assert_eq!(first.site_amplifications(), second.site_amplifications());
    assert_eq!(first.rows(), second.rows());
}

#[test]
fn bands_are_independent() {
    let low = FrequencyBand::octave(1.5);
    let high = FrequencyBand::octave(6.0);
    let sites = [("A", 2.0), ("B", 0.5), ("C", 1.0), ("D", 1.0)];
    let config = coupling_config();

    let alone = run_coupled_inversion(vec![network_dataset(low, &sites)], &config).unwrap();
    let both = run_coupled_inversion(
        vec![network_dataset(low, &sites), network_dataset(high, &sites)],
        &config,
    )
    .unwrap();
    assert_eq!(both.band_results.len(), 2);
    assert_eq!(alone.band(&low), both.band(&low));
}

#[test]
fn separate_networks_align_on_shared_stations() {
    let band = FrequencyBand::octave(3.0);
    let config = coupling_config();
    let west = run_coupled_inversion(
        vec![network_dataset(band, &[("A", 2.0), ("B", 0.5), ("C", 1.0)])],
        &config,
    )
    .unwrap();
    let east = run_coupled_inversion(
        vec![network_dataset(band, &[("B", 0.5), ("C", 1.0), ("D", 4.0)])],
        &config,
    )
    .unwrap();
    let mut reports = vec![west, east];

    let summaries =
        align_site_responses(&mut reports, &SiteNormalization::GeometricMean { response: 1.0 })
            .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].stations, 4);

    let (west, east) = (&reports[0], &reports[1]);
    for station in ["B", "C"] {
        assert_relative_eq!(
            west.site(station)[0].1,
            east.site(station)[0].1,
            max_relative = 1e-3
        );
    }
    // Relative responses survive: D / B = 8 in the truth.
    assert_relative_eq!(
        east.site("D")[0].1 / west.site("B")[0].1,
        8.0,
        max_relative = 0.02
    );
}

#[test]
fn strongly_amplified_station_survives_default_outlier_rule() {
    let band = FrequencyBand::octave(3.0);
    let sites = [("A", 0.8), ("B", 1.2), ("C", 1.0), ("D", 0.9), ("E", 1.1), ("F", 8.0)];
    let config = InversionConfig {
        max_coupling_iterations: 100,
        ..linear_config()
    };
    let report = run_coupled_inversion(vec![network_dataset(band, &sites)], &config).unwrap();
    let result = report.band(&band).unwrap();

    assert!(result.exclusions.is_empty());
    assert_eq!(result.sites["F"].envelopes, 5);
    assert!(result
        .events
        .values()
        .all(|o| o.status == EventStatus::Converged));

    let mean_log = sites.iter().map(|&(_, s)| f64::ln(s)).sum::<f64>() / sites.len() as f64;
    for (station, truth) in sites {
        assert_relative_eq!(
            result.sites[station].amplification,
            truth / mean_log.exp(),
            max_relative = 0.02
        );
    }
}

#[test]
fn injected_outlier_is_the_only_envelope_removed() {
    let band = FrequencyBand::octave(3.0);
    let stations = ["A", "B", "C", "D", "E"];
    // One record of ev2 at C is twenty times too strong.
    let events = network_events(&stations, |k, name| {
        if k == 2 && name == "C" {
            20.0
        } else {
            1.0
        }
    });
    let dataset = synthetic_dataset(&events, &network_synth(band, 250.0)).unwrap();

    let report = run_coupled_inversion(vec![dataset], &linear_config()).unwrap();
    let result = report.band(&band).unwrap();

    assert_eq!(result.exclusions.len(), 1);
    let exclusion = &result.exclusions[0];
    assert_eq!((exclusion.event_id.as_str(), exclusion.station.as_str()), ("ev2", "C"));
    assert!(matches!(exclusion.reason, ExclusionReason::Outlier { residual, .. } if residual > 1.0));
    assert!(result
        .events
        .values()
        .all(|o| o.status == EventStatus::Converged));
    assert_eq!(result.sites["C"].envelopes, 4);
    for station in stations {
        assert_relative_eq!(result.sites[station].amplification, 1.0, max_relative = 1e-3);
    }
    assert!(report.convergence[0].site_terms_converged);
}

#[test]
fn event_out_of_iteration_budget_is_non_convergent() {
    let band = FrequencyBand::octave(3.0);
    let stations = ["A", "B", "C", "D"];
    let regular = network_synth(band, 250.0);
    let mut envelopes = synthetic_envelopes(&network_events(&stations, |_, _| 1.0), &regular)
        .unwrap();
    let odd = event(
        "odd",
        2e5,
        &[("A", 15.0, 1.0), ("B", 35.0, 1.0), ("C", 60.0, 1.0), ("D", 90.0, 1.0)],
    );
    envelopes.extend(synthetic_envelopes(&[odd], &network_synth(band, 60.0)).unwrap());

    // Regular events start at their true attenuation and fit without a step.
    let mut config = InversionConfig {
        initial_intrinsic: regular.intrinsic,
        ..linear_config()
    };
    config.solver.max_iterations = 1;
    let report =
        run_coupled_inversion(vec![Dataset::from_envelopes(band, envelopes)], &config).unwrap();
    let result = report.band(&band).unwrap();

    let odd = &result.events["odd"];
    assert_eq!(odd.status, EventStatus::ExcludedNonConvergent);
    assert!(odd.fit.is_none());
    assert!(odd.error.as_deref().unwrap().contains("iteration limit"));
    for k in 0..5 {
        assert_eq!(result.events[&format!("ev{k}")].status, EventStatus::Converged);
    }
    assert_eq!(result.summary.converged, 5);
    assert!(result.exclusions.is_empty());
}
