//! Health checks for readiness and liveness checks
//!
//! Checks run against a [`ServiceHandle`], the cloneable slice of the
//! running service the HTTP endpoints are allowed to see.

use crate::amqp::connection::AmqpConnection;
use crate::engine::RankedEngine;
use crate::store::StoreCounts;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value: 2 healthy, 1 degraded, 0 unhealthy
    pub fn as_gauge(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What the health endpoints can observe of the running service
#[derive(Clone)]
pub struct ServiceHandle {
    pub name: String,
    pub engine: Arc<RankedEngine>,
    pub is_running: Arc<RwLock<bool>>,
    pub amqp: Option<Arc<AmqpConnection>>,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>, engine: Arc<RankedEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
            is_running: Arc::new(RwLock::new(false)),
            amqp: None,
        }
    }

    pub fn with_running_flag(mut self, is_running: Arc<RwLock<bool>>) -> Self {
        self.is_running = is_running;
        self
    }

    pub fn with_amqp(mut self, amqp: Arc<AmqpConnection>) -> Self {
        self.amqp = Some(amqp);
        self
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional error message if unhealthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Engine statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub players_queued: usize,
    pub open_matches: usize,
    pub total_matches: usize,
    pub pending_reports: usize,
    pub disputes: usize,
    pub uptime_seconds: i64,
}

impl ServiceStats {
    fn from_counts(counts: &StoreCounts, uptime_seconds: i64) -> Self {
        Self {
            players_queued: counts.queue_entries,
            open_matches: counts.open_matches,
            total_matches: counts.total_matches,
            pending_reports: counts.pending_reports,
            disputes: counts.disputes,
            uptime_seconds,
        }
    }
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(handle: &ServiceHandle) -> Result<Self> {
        let mut checks = Vec::new();

        checks.push(Self::check_service_running(handle).await);
        let (store_check, counts) = Self::check_store(handle).await;
        checks.push(store_check);
        if let Some(amqp_check) = Self::check_amqp(handle) {
            checks.push(amqp_check);
        }

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));

        let metrics = handle.engine.metrics();
        for check in &checks {
            metrics.update_component_health(&check.name, check.status != HealthStatus::Unhealthy);
        }
        metrics.update_health_status(status.as_gauge());

        let uptime = metrics.service().uptime_seconds.get();
        let stats = counts
            .map(|counts| ServiceStats::from_counts(&counts, uptime))
            .unwrap_or_default();

        Ok(HealthCheck {
            status,
            service: handle.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Liveness: the service has started and not begun shutting down
    pub async fn liveness_check(handle: &ServiceHandle) -> HealthStatus {
        if handle.is_running().await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Readiness: running, store reachable, broker connected
    pub async fn readiness_check(handle: &ServiceHandle) -> HealthStatus {
        if !handle.is_running().await {
            return HealthStatus::Unhealthy;
        }

        let (store_check, _) = Self::check_store(handle).await;
        match Self::check_amqp(handle) {
            Some(amqp_check) => store_check.status.worst(amqp_check.status),
            None => store_check.status,
        }
    }

    async fn check_service_running(handle: &ServiceHandle) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if handle.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_store(handle: &ServiceHandle) -> (ComponentCheck, Option<StoreCounts>) {
        let start = std::time::Instant::now();

        let (status, message, counts) = match handle.engine.stats().await {
            Ok(counts) => (HealthStatus::Healthy, None, Some(counts)),
            Err(e) => {
                error!("Document store check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("Store unavailable: {}", e)),
                    None,
                )
            }
        };

        let check = ComponentCheck {
            name: "document_store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        (check, counts)
    }

    fn check_amqp(handle: &ServiceHandle) -> Option<ComponentCheck> {
        let start = std::time::Instant::now();
        let connection = handle.amqp.as_ref()?;

        let (status, message) = if connection.is_alive() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("AMQP connection closed".to_string()),
            )
        };

        Some(ComponentCheck {
            name: "amqp_connection".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
