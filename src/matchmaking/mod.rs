//! Matchmaking: pair scoring and the periodic pass that creates matches

pub mod matchmaker;
pub mod scorer;

pub use matchmaker::{Matchmaker, PassReport};
pub use scorer::{select_pairs, PairScorer, Pairing, ScoreWeights, WeightedPairScorer};
