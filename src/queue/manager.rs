//! Queue manager: join eligibility, leaving, and ageing out stale entries

use crate::amqp::publisher::{publish_all, NotificationPublisher};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::store::DocumentStore;
use crate::types::{Notification, NotificationKind, PlayerId, PlayerProfile, QueueEntry};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the sweep removed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    MaxAge,
    MaxAttempts,
}

impl ExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpiryReason::MaxAge => "max_age",
            ExpiryReason::MaxAttempts => "max_attempts",
        }
    }
}

/// Result of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<(PlayerId, ExpiryReason)>,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired.len()
    }
}

/// Tracks players waiting for a match
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    metrics: Arc<MetricsCollector>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn NotificationPublisher>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
            metrics,
        }
    }

    /// Put a player in the queue after checking eligibility
    pub async fn join(&self, player_id: &str, region: &str) -> Result<QueueEntry> {
        let result = self.try_join(player_id, region).await;
        match &result {
            Ok(entry) => {
                self.metrics.record_queue_join();
                info!(
                    "Player '{}' joined the {} queue (rep {}, {})",
                    entry.player_id, entry.region, entry.rep, entry.rank_tier
                );
            }
            Err(e) => {
                self.metrics.record_queue_rejection(e.code());
                debug!("Queue join rejected for '{}': {}", player_id, e);
            }
        }
        result
    }

    async fn try_join(&self, player_id: &str, region: &str) -> Result<QueueEntry> {
        let region = region.trim();
        if player_id.trim().is_empty() {
            return Err(EngineError::validation("Player ID cannot be empty"));
        }
        if region.is_empty() {
            return Err(EngineError::validation("Region cannot be empty"));
        }

        if self.store.get_queue_entry(player_id).await?.is_some() {
            return Err(EngineError::AlreadyQueued {
                player_id: player_id.to_string(),
            });
        }
        if let Some(active) = self.store.active_match_for_player(player_id).await? {
            return Err(EngineError::AlreadyInMatch {
                player_id: player_id.to_string(),
                match_id: active.match_id,
            });
        }

        let profile = self
            .store
            .get_profile(player_id)
            .await?
            .ok_or_else(|| EngineError::PlayerNotFound {
                player_id: player_id.to_string(),
            })?;

        let now = self.clock.now();
        if self.is_inactive(&profile, now) {
            return Err(EngineError::Inactive {
                player_id: player_id.to_string(),
                window_days: self.config.inactivity_window_days,
            });
        }

        let entry = Self::snapshot(&profile, region, now);
        self.store.insert_queue_entry(entry.clone()).await?;
        Ok(entry)
    }

    /// Remove a player from the queue
    pub async fn leave(&self, player_id: &str) -> Result<QueueEntry> {
        let entry = self
            .store
            .remove_queue_entry(player_id)
            .await?
            .ok_or_else(|| EngineError::NotQueued {
                player_id: player_id.to_string(),
            })?;

        self.metrics.record_queue_leave();
        info!("Player '{}' left the queue", player_id);
        Ok(entry)
    }

    /// Queue a player again after their match was cancelled. Skips the
    /// inactivity check since they were just playing.
    pub async fn requeue(&self, player_id: &str, region: &str) -> Result<QueueEntry> {
        let profile = self
            .store
            .get_profile(player_id)
            .await?
            .ok_or_else(|| EngineError::PlayerNotFound {
                player_id: player_id.to_string(),
            })?;

        let entry = Self::snapshot(&profile, region, self.clock.now());
        self.store.insert_queue_entry(entry.clone()).await?;
        self.metrics.record_requeue();
        info!("Player '{}' requeued in {}", player_id, region);
        Ok(entry)
    }

    /// Remove entries that are too old or went unpaired too often
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let max_age = self.config.max_queue_age();
        let mut report = SweepReport::default();
        let mut notifications = Vec::new();

        for entry in self.store.list_queue_entries().await? {
            let reason = if now - entry.joined_at > max_age {
                ExpiryReason::MaxAge
            } else if entry.match_attempts >= self.config.max_match_attempts {
                ExpiryReason::MaxAttempts
            } else {
                continue;
            };

            // The entry may have been paired or withdrawn since the listing.
            if self.store.remove_queue_entry(&entry.player_id).await?.is_none() {
                continue;
            }

            self.metrics.record_queue_expired(reason.as_str());
            notifications.push(Notification::new(
                entry.player_id.clone(),
                NotificationKind::QueueExpired,
                json!({
                    "reason": reason.as_str(),
                    "joined_at": entry.joined_at,
                    "match_attempts": entry.match_attempts,
                }),
            ));
            report.expired.push((entry.player_id, reason));
        }

        if report.removed() > 0 {
            warn!("Queue sweep removed {} stale entries", report.removed());
        } else {
            debug!("Queue sweep completed - no stale entries");
        }

        publish_all(self.publisher.as_ref(), notifications).await;
        Ok(report)
    }

    fn is_inactive(&self, profile: &PlayerProfile, now: DateTime<Utc>) -> bool {
        match profile.last_match_at {
            Some(last) => now - last > self.config.inactivity_window(),
            None => false,
        }
    }

    fn snapshot(profile: &PlayerProfile, region: &str, now: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            player_id: profile.player_id.clone(),
            region: region.to_string(),
            rep: profile.rep,
            rank_tier: profile.rank_tier(),
            win_streak: profile.win_streak,
            win_rate: profile.win_rate(),
            joined_at: now,
            match_attempts: 0,
        }
    }
}
