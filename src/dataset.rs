//! Envelopes of one band grouped by event.
//!
//! Collaborators assemble a [`Dataset`]; afterwards only the quality filter
//! removes entries, and every removal leaves an [`Exclusion`] behind.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::band::FrequencyBand;
use crate::config::InversionConfig;
use crate::envelope::{build_envelope, Envelope, EnvelopeError, TimeWindow, Trace};

/// Why an envelope (or a station that never produced one) left the dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    InsufficientData { reason: String },
    LowSnr { snr: f64 },
    Outlier { residual: f64, pass: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exclusion {
    pub event_id: String,
    pub station: String,
    pub reason: ExclusionReason,
}

/// A trace with the windows its envelope is cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub trace: Trace,
    pub noise_window: TimeWindow,
    pub signal_window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    band: FrequencyBand,
    events: BTreeMap<String, Vec<Envelope>>,
    exclusions: Vec<Exclusion>,
}

impl Dataset {
    pub fn new(band: FrequencyBand) -> Self {
        Self {
            band,
            events: BTreeMap::new(),
            exclusions: Vec::new(),
        }
    }

    pub fn from_envelopes<I>(band: FrequencyBand, envelopes: I) -> Self
    where
        I: IntoIterator<Item = Envelope>,
    {
        let mut dataset = Self::new(band);
        for envelope in envelopes {
            dataset.insert(envelope);
        }
        dataset
    }

    pub fn insert(&mut self, envelope: Envelope) {
        self.events
            .entry(envelope.event_id().to_string())
            .or_default()
            .push(envelope);
    }

    pub fn band(&self) -> &FrequencyBand {
        &self.band
    }

    pub fn events(&self) -> &BTreeMap<String, Vec<Envelope>> {
        &self.events
    }

    pub fn event(&self, event_id: &str) -> Option<&[Envelope]> {
        self.events.get(event_id).map(Vec::as_slice)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Total number of envelopes over all events.
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stations(&self) -> BTreeSet<&str> {
        self.events
            .values()
            .flatten()
            .map(Envelope::station)
            .collect()
    }

    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    pub fn record_exclusion(&mut self, exclusion: Exclusion) {
        self.exclusions.push(exclusion);
    }

    /// Drop every envelope for which `verdict` returns a reason; events left
    /// without envelopes disappear. Returns the number of removed envelopes.
    pub(crate) fn remove_where<F>(&mut self, mut verdict: F) -> usize
    where
        F: FnMut(&Envelope) -> Option<ExclusionReason>,
    {
        let mut removed = 0;
        for envelopes in self.events.values_mut() {
            let mut kept = Vec::with_capacity(envelopes.len());
            for envelope in envelopes.drain(..) {
                match verdict(&envelope) {
                    Some(reason) => {
                        self.exclusions.push(Exclusion {
                            event_id: envelope.event_id().to_string(),
                            station: envelope.station().to_string(),
                            reason,
                        });
                        removed += 1;
                    }
                    None => kept.push(envelope),
                }
            }
            *envelopes = kept;
        }
        self.events.retain(|_, envelopes| !envelopes.is_empty());
        removed
    }
}

/// Build the envelopes of one band from raw segments.
///
/// Segments that cannot produce an envelope are recorded as exclusions.
pub fn build_dataset(
    segments: &[Segment],
    band: &FrequencyBand,
    config: &InversionConfig,
) -> Dataset {
    let mut dataset = Dataset::new(*band);
    for segment in segments {
        match build_envelope(
            &segment.trace,
            band,
            segment.noise_window,
            segment.signal_window,
            &config.envelope,
        ) {
            Ok(envelope) => dataset.insert(envelope),
            Err(err) => {
                tracing::warn!(%band, "dropping station: {err}");
                let reason = match &err {
                    EnvelopeError::InsufficientData { reason, .. }
                    | EnvelopeError::InvalidEnvelope { reason, .. } => reason.clone(),
                };
                dataset.record_exclusion(Exclusion {
                    event_id: segment.trace.event_id.clone(),
                    station: segment.trace.station.clone(),
                    reason: ExclusionReason::InsufficientData { reason },
                });
            }
        }
    }
    dataset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(event: &str, station: &str) -> Envelope {
        Envelope::new(
            event,
            station,
            FrequencyBand::new(1.0, 2.0),
            vec![1.0, 2.0],
            vec![1.0, 1.0],
            10.0,
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn groups_by_event() {
        let ds = Dataset::from_envelopes(
            FrequencyBand::new(1.0, 2.0),
            [env("e1", "A"), env("e2", "A"), env("e1", "B")],
        );
        assert_eq!(ds.event_count(), 2);
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.event("e1").map(<[Envelope]>::len), Some(2));
        assert_eq!(ds.stations().into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn removal_records_reason_and_drops_empty_events() {
        let mut ds = Dataset::from_envelopes(
            FrequencyBand::new(1.0, 2.0),
            [env("e1", "A"), env("e2", "A"), env("e1", "B")],
        );
        let removed = ds.remove_where(|e| {
            (e.event_id() == "e2").then(|| ExclusionReason::LowSnr { snr: 0.5 })
        });
        assert_eq!(removed, 1);
        assert_eq!(ds.event_count(), 1);
        assert_eq!(ds.exclusions().len(), 1);
        assert_eq!(ds.exclusions()[0].event_id, "e2");
    }

    #[test]
    fn unbuildable_segment_becomes_exclusion() {
        let trace = Trace {
            event_id: "e1".to_string(),
            station: "A".to_string(),
            samples: vec![0.0; 10],
            sample_rate: 20.0,
            start_offset: 0.0,
            distance_km: 10.0,
            travel_time: 1.0,
        };
        let segment = Segment {
            trace,
            noise_window: TimeWindow::new(0.0, 0.2),
            signal_window: TimeWindow::new(1.0, 5.0),
        };
        let ds = build_dataset(
            &[segment],
            &FrequencyBand::new(1.0, 2.0),
            &InversionConfig::default(),
        );
        assert!(ds.is_empty());
        assert!(matches!(
            ds.exclusions()[0].reason,
            ExclusionReason::InsufficientData { .. }
        ));
    }
}
