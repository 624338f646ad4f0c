//! Club league collaborator
//!
//! Club standings live outside the engine; completed matches only forward
//! rep deltas to whichever league implementation is plugged in.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// External league that tracks club rep per season
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClubLeagueProvider: Send + Sync {
    async fn is_season_active(&self) -> Result<bool>;

    async fn is_tracked(&self, club_id: &str) -> Result<bool>;

    /// Add `delta` to the club's season rep, flooring at zero. Returns the new total.
    async fn apply_club_rep(&self, club_id: &str, delta: i32) -> Result<u32>;
}

/// League that never has an active season
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClubLeague;

#[async_trait]
impl ClubLeagueProvider for NoClubLeague {
    async fn is_season_active(&self) -> Result<bool> {
        Ok(false)
    }

    async fn is_tracked(&self, _club_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn apply_club_rep(&self, club_id: &str, _delta: i32) -> Result<u32> {
        Err(EngineError::validation(format!(
            "Club {} is not part of a league",
            club_id
        )))
    }
}

#[derive(Debug, Default)]
struct LeagueState {
    season_active: bool,
    standings: HashMap<String, u32>,
}

/// In-process league used by the simulator and tests
#[derive(Debug, Default)]
pub struct InMemoryClubLeague {
    state: RwLock<LeagueState>,
}

impl InMemoryClubLeague {
    /// Active season tracking the given clubs, all starting at zero
    pub fn with_clubs<I, S>(clubs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let standings = clubs.into_iter().map(|c| (c.into(), 0)).collect();
        Self {
            state: RwLock::new(LeagueState {
                season_active: true,
                standings,
            }),
        }
    }

    pub fn set_season_active(&self, active: bool) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| EngineError::internal("Failed to acquire league write lock"))?;
        state.season_active = active;
        Ok(())
    }

    pub fn club_rep(&self, club_id: &str) -> Result<Option<u32>> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::internal("Failed to acquire league read lock"))?;
        Ok(state.standings.get(club_id).copied())
    }

    /// Clubs ordered by rep, highest first
    pub fn standings(&self) -> Result<Vec<(String, u32)>> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::internal("Failed to acquire league read lock"))?;
        let mut standings: Vec<(String, u32)> = state
            .standings
            .iter()
            .map(|(club, rep)| (club.clone(), *rep))
            .collect();
        standings.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(standings)
    }
}

#[async_trait]
impl ClubLeagueProvider for InMemoryClubLeague {
    async fn is_season_active(&self) -> Result<bool> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::internal("Failed to acquire league read lock"))?;
        Ok(state.season_active)
    }

    async fn is_tracked(&self, club_id: &str) -> Result<bool> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::internal("Failed to acquire league read lock"))?;
        Ok(state.standings.contains_key(club_id))
    }

    async fn apply_club_rep(&self, club_id: &str, delta: i32) -> Result<u32> {
        let mut state = self
            .state
            .write()
            .map_err(|_| EngineError::internal("Failed to acquire league write lock"))?;
        let rep = state.standings.get_mut(club_id).ok_or_else(|| {
            EngineError::validation(format!("Club {} is not part of the league", club_id))
        })?;
        *rep = crate::outcome::rep::apply_delta(*rep, delta);
        debug!("Club {} rep {:+} -> {}", club_id, delta, rep);
        Ok(*rep)
    }
}
