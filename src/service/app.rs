//! Main application state and service coordination
//!
//! [`AppState`] wires the engine to its transport: it owns the AMQP
//! connection, the command consumer, the scheduler driving the timed passes
//! and the metrics/health server.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::{CommandConsumer, CommandHandler};
use crate::amqp::messages::EngineCommand;
use crate::amqp::publisher::{AmqpNotificationPublisher, PublisherConfig};
use crate::club::{ClubLeagueProvider, NoClubLeague};
use crate::config::AppConfig;
use crate::engine::RankedEngine;
use crate::error::{EngineError, Result as EngineResult};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::scheduler::Scheduler;
use crate::service::health::{HealthCheck, ServiceHandle};
use crate::store::InMemoryDocumentStore;
use amqprs::channel::QueueDeclareArguments;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Forwards consumed commands to the engine
pub struct EngineCommandHandler {
    engine: Arc<RankedEngine>,
}

impl EngineCommandHandler {
    pub fn new(engine: Arc<RankedEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandHandler for EngineCommandHandler {
    async fn handle_command(&self, command: EngineCommand) -> EngineResult<()> {
        self.engine.execute(command).await
    }

    async fn handle_error(&self, error: EngineError, message_data: &[u8]) {
        // Engine rejections were already answered with CommandRejected; only
        // undecodable deliveries reach here without a reply.
        if matches!(error, EngineError::Validation { .. }) {
            warn!(
                "Dropping malformed command ({} bytes): {}",
                message_data.len(),
                error
            );
            self.engine
                .metrics()
                .record_command("malformed", Some(error.code()), Duration::ZERO);
        } else {
            debug!("Command rejected: {}", error);
        }
    }
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    engine: Arc<RankedEngine>,

    /// Drives matchmaking and the sweeps
    scheduler: Scheduler,

    amqp_connection: Arc<AmqpConnection>,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Health server and uptime task handles
    background_tasks: Vec<JoinHandle<()>>,

    command_consumer: Option<CommandConsumer>,

    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application without a club league
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        Self::with_clubs(config, Arc::new(NoClubLeague)).await
    }

    /// Initialize the application with all dependencies
    pub async fn with_clubs(
        config: AppConfig,
        clubs: Arc<dyn ClubLeagueProvider>,
    ) -> Result<Self, ServiceError> {
        info!("Initializing {} service", config.service.name);
        info!(
            "Configuration: service={}, amqp_url={}, command_queue={}",
            config.service.name, config.amqp.url, config.amqp.command_queue
        );

        let amqp_connection = Self::initialize_amqp(&config).await?;

        let collector = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let engine = Self::initialize_engine(&config, &amqp_connection, clubs, collector.clone())
            .await?;
        let is_running = Arc::new(RwLock::new(false));

        let handle = ServiceHandle::new(config.service.name.clone(), engine.clone())
            .with_running_flag(is_running.clone())
            .with_amqp(amqp_connection.clone());
        let metrics_service = Self::initialize_metrics(&config, collector, handle);

        let scheduler = Scheduler::new(engine.clone());

        Ok(Self {
            config,
            engine,
            scheduler,
            amqp_connection,
            metrics_service,
            background_tasks: Vec::new(),
            command_consumer: None,
            is_running,
        })
    }

    /// Start all background services and message consumption
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} service", self.config.service.name);

        *self.is_running.write().await = true;

        self.start_metrics_service().await?;
        self.start_command_consumption().await?;
        self.scheduler.start().await;
        self.start_health_task();

        info!("{} service started", self.config.service.name);
        Ok(())
    }

    /// Stop consuming, let the passes finish, then stop the health server
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);

        *self.is_running.write().await = false;

        if let Some(consumer) = self.command_consumer.take() {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop command consumer: {}", e);
            } else {
                info!("Command consumption stopped");
            }
        }

        self.scheduler.stop().await;

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }
        self.stop_background_tasks().await;

        self.engine.log_summary().await;
        info!("{} shutdown completed", self.config.service.name);

        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn engine(&self) -> Arc<RankedEngine> {
        self.engine.clone()
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    pub fn amqp_connection(&self) -> Arc<AmqpConnection> {
        self.amqp_connection.clone()
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker: {}", config.amqp.url);

        let amqp_config =
            AmqpConfig::from_settings(&config.amqp).map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn initialize_engine(
        config: &AppConfig,
        amqp_connection: &AmqpConnection,
        clubs: Arc<dyn ClubLeagueProvider>,
        collector: Arc<MetricsCollector>,
    ) -> Result<Arc<RankedEngine>, ServiceError> {
        let channel = amqp_connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open publisher channel: {}", e),
            })?;

        let publisher_config = PublisherConfig {
            exchange: config.amqp.notification_exchange.clone(),
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
            ..PublisherConfig::default()
        };
        let publisher = AmqpNotificationPublisher::new(channel, publisher_config)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to set up notification publisher: {}", e),
            })?;

        let engine = RankedEngine::builder(config.engine.clone())
            .store(Arc::new(InMemoryDocumentStore::new()))
            .publisher(Arc::new(publisher))
            .clubs(clubs)
            .metrics(collector)
            .build()
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to build engine: {}", e),
            })?;

        Ok(Arc::new(engine))
    }

    fn initialize_metrics(
        config: &AppConfig,
        collector: Arc<MetricsCollector>,
        handle: ServiceHandle,
    ) -> Arc<MetricsService> {
        info!(
            "Initializing metrics service on port {}",
            config.service.health_port
        );

        let health_config = HealthServerConfig {
            port: config.service.health_port,
            host: "0.0.0.0".to_string(),
        };
        let health_server =
            Arc::new(HealthServer::new(health_config, collector.clone()).with_service(handle));

        Arc::new(MetricsService::new(collector, health_server))
    }

    async fn start_metrics_service(&mut self) -> Result<(), ServiceError> {
        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.health_port;

        let handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            }
        });
        self.background_tasks.push(handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("Metrics service started on port {}", port);
        Ok(())
    }

    async fn start_command_consumption(&mut self) -> Result<(), ServiceError> {
        let queue = self.config.amqp.command_queue.clone();

        let channel =
            self.amqp_connection
                .open_channel()
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to open consumer channel: {}", e),
                })?;

        let queue_declare_args = QueueDeclareArguments::new(&queue)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(queue_declare_args)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;
        debug!("Queue '{}' declared", queue);

        let handler = Arc::new(EngineCommandHandler::new(self.engine.clone()));
        let consumer = CommandConsumer::new(handler, channel);
        consumer
            .start_consuming(&queue)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming commands: {}", e),
            })?;

        self.command_consumer = Some(consumer);
        info!("Listening for player commands on '{}'", queue);
        Ok(())
    }

    /// Refresh uptime and component health gauges every 30s
    fn start_health_task(&mut self) {
        let handle = ServiceHandle::new(self.config.service.name.clone(), self.engine.clone())
            .with_running_flag(self.is_running.clone())
            .with_amqp(self.amqp_connection.clone());
        let collector = self.metrics_service.collector();

        self.background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            let start_time = tokio::time::Instant::now();

            while handle.is_running().await {
                interval.tick().await;

                collector
                    .service()
                    .uptime_seconds
                    .set(start_time.elapsed().as_secs() as i64);

                match HealthCheck::check(&handle).await {
                    Ok(health) => debug!("Health check: {}", health.status),
                    Err(e) => warn!("Health check failed: {}", e),
                }
            }

            debug!("Health task stopped");
        }));
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        // The health server exits on its shutdown signal; give it a moment
        tokio::time::sleep(Duration::from_millis(200)).await;
        for task in self.background_tasks.drain(..) {
            task.abort();
        }

        info!("Stopped {} background tasks", task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockNotificationPublisher;
    use crate::config::EngineConfig;
    use crate::types::{NotificationKind, PlayerProfile};

    #[tokio::test]
    async fn test_engine_command_handler_dispatches() {
        let publisher = Arc::new(MockNotificationPublisher::new());
        let engine = Arc::new(
            RankedEngine::builder(EngineConfig::default())
                .store(Arc::new(InMemoryDocumentStore::with_profiles(vec![
                    PlayerProfile::new("p1", 1000, "NA"),
                ])))
                .publisher(publisher.clone())
                .build()
                .unwrap(),
        );
        let handler = EngineCommandHandler::new(engine.clone());

        handler
            .handle_command(EngineCommand::JoinQueue {
                player_id: "p1".to_string(),
                region: "NA".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(engine.stats().await.unwrap().queue_entries, 1);

        let err = handler
            .handle_command(EngineCommand::JoinQueue {
                player_id: "p1".to_string(),
                region: "NA".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyQueued { .. }));
        assert_eq!(publisher.count_of(NotificationKind::CommandRejected), 1);

        handler.handle_error(err, b"{}").await;
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::Configuration {
            message: "bad port".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: bad port");
    }
}
