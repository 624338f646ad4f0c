//! Match lifecycle: the transition graph and the machine that walks it

pub mod graph;
pub mod machine;

pub use machine::{default_host, DeadlineReport, PhaseMachine, Transition};
