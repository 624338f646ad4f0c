//! Score reporting, dispute detection and rep updates

pub mod engine;
pub mod rep;

pub use engine::{OutcomeEngine, ReportOutcome};
pub use rep::{apply_delta, club_rep_gain, compute_rep_change, RepChange, RepInput};
