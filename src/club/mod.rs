//! Club league integration

pub mod provider;

#[cfg(test)]
pub use provider::MockClubLeagueProvider;
pub use provider::{ClubLeagueProvider, InMemoryClubLeague, NoClubLeague};
