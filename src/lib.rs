//! coda-envelope - Coda energy-envelope inversion
//!
//! Estimates intrinsic attenuation (Q), scattering strength, station site
//! amplification and source energy from band-limited energy envelopes.
//! Every frequency band is inverted independently; within a band the
//! per-event fits are coupled through shared site terms that are refined
//! until they stop moving.

pub mod align;
pub mod band;
pub mod config;
pub mod dataset;
pub mod envelope;
pub mod filter;
pub mod inversion;
pub mod model;
pub mod params;
pub mod quality;
pub mod report;
pub mod stats;
pub mod synthetic;

use thiserror::Error;

// Re-export main types
pub use align::{align_band_results, align_site_responses, AlignmentSummary};
pub use band::FrequencyBand;
pub use config::{InversionConfig, OutlierRule, SiteAggregation, SiteNormalization};
pub use dataset::{build_dataset, Dataset, Exclusion, ExclusionReason, Segment};
pub use envelope::{build_envelope, Envelope, EnvelopeError, TimeWindow, Trace};
pub use inversion::{
    invert_event, run_coupled_inversion, CouplingIterator, CouplingState, FitResult,
    InitialGuess, InversionError,
};
pub use model::{ForwardModel, GreensCache, ScatteringModel};
pub use params::{EventParams, ParameterMode, ParameterSet, SiteTable};
pub use report::{BandResult, EventOutcome, EventStatus, InversionReport, ReportRow};

/// Run-level errors. Per-event and per-station failures never surface here;
/// they are recorded in the report instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("configuration contradiction: {0}")]
    ConfigContradiction(String),
    #[error("alignment failed: {0}")]
    Alignment(String),
}
