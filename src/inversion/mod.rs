//! Inversion engine: per-event fits and their coupling through site terms.

pub mod coupling;
pub mod event;
mod solver;

pub use coupling::{
    run_coupled_inversion, ConvergenceReport, CouplingIterator, CouplingState, PassSummary,
    Termination,
};
pub use event::{
    invert_event, invert_event_with_cache, FitResult, InitialGuess, InversionError,
    ParameterUncertainty, StationResidual,
};
