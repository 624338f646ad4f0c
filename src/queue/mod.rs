//! Queue management
//!
//! Players enter the queue here and leave it either voluntarily, by being
//! paired into a match, or by being aged out by the sweep.

pub mod manager;

pub use manager::{ExpiryReason, QueueManager, SweepReport};
