//! Notification publishing for the presentation layer

use crate::amqp::messages::{MessageEnvelope, MessageUtils};
use crate::error::{EngineError, Result};
use crate::types::{Notification, NotificationKind};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Sink for engine notifications
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, notification: Notification) -> Result<()>;
}

/// Publish each notification, logging failures instead of returning them.
/// Callers have already committed the state change being announced.
pub async fn publish_all(publisher: &dyn NotificationPublisher, notifications: Vec<Notification>) {
    for notification in notifications {
        let recipient = notification.recipient_id.clone();
        let kind = notification.kind;
        if let Err(e) = publisher.publish(notification).await {
            warn!(
                "Failed to publish {} notification to {}: {}",
                kind.as_str(),
                recipient,
                e
            );
        }
    }
}

/// Configuration for notification publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: crate::amqp::messages::NOTIFICATION_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
        }
    }
}

/// AMQP-based notification publisher
pub struct AmqpNotificationPublisher {
    channel: Channel,
    config: PublisherConfig,
    published_messages: Mutex<HashSet<String>>,
}

impl AmqpNotificationPublisher {
    /// Create a publisher and declare its exchange
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            published_messages: Mutex::new(HashSet::new()),
        };

        publisher.setup_exchange().await?;
        Ok(publisher)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange, "topic");
        self.channel.exchange_declare(args).await.map_err(|e| {
            EngineError::AmqpConnectionFailed {
                message: format!("Failed to declare notification exchange: {}", e),
            }
        })?;

        info!("Declared notification exchange '{}'", self.config.exchange);
        Ok(())
    }

    fn already_published(&self, correlation_id: &str) -> Result<bool> {
        if !self.config.enable_deduplication {
            return Ok(false);
        }
        let published = self
            .published_messages
            .lock()
            .map_err(|_| EngineError::internal("Failed to acquire published messages lock"))?;
        Ok(published.contains(correlation_id))
    }

    fn remember_published(&self, correlation_id: &str) -> Result<()> {
        if !self.config.enable_deduplication {
            return Ok(());
        }
        let mut published = self
            .published_messages
            .lock()
            .map_err(|_| EngineError::internal("Failed to acquire published messages lock"))?;
        published.insert(correlation_id.to_string());
        Ok(())
    }

    /// Publish an envelope with doubling retry delay
    async fn publish_envelope(&self, envelope: &MessageEnvelope<Notification>) -> Result<()> {
        if self.already_published(&envelope.correlation_id)? {
            debug!(
                "Message {} already published, skipping",
                envelope.correlation_id
            );
            return Ok(());
        }

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(()) => {
                    self.remember_published(&envelope.correlation_id)?;
                    debug!(
                        "Published {} to {}",
                        envelope.routing_key, envelope.payload.recipient_id
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    async fn try_publish(&self, envelope: &MessageEnvelope<Notification>) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| EngineError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })
    }

    /// Number of remembered correlation ids
    pub fn cached_message_count(&self) -> usize {
        self.published_messages
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl NotificationPublisher for AmqpNotificationPublisher {
    async fn publish(&self, notification: Notification) -> Result<()> {
        let routing_key = MessageUtils::notification_routing_key(&notification);
        let envelope = MessageEnvelope::new(notification, routing_key);
        self.publish_envelope(&envelope).await
    }
}

/// Recording publisher for tests and the simulator
#[derive(Debug, Default)]
pub struct MockNotificationPublisher {
    published: Mutex<Vec<Notification>>,
}

impl MockNotificationPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications published so far
    pub fn notifications(&self) -> Vec<Notification> {
        self.published
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn notifications_for(&self, recipient_id: &str) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.recipient_id == recipient_id)
            .collect()
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        self.notifications()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.published.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl NotificationPublisher for MockNotificationPublisher {
    async fn publish(&self, notification: Notification) -> Result<()> {
        if let Ok(mut events) = self.published.lock() {
            events.push(notification);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingPublisher;

    #[async_trait]
    impl NotificationPublisher for FailingPublisher {
        async fn publish(&self, _notification: Notification) -> Result<()> {
            Err(EngineError::AmqpConnectionFailed {
                message: "broker down".to_string(),
            })
        }
    }

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.exchange, "ranked.notifications");
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_deduplication);
    }

    #[tokio::test]
    async fn test_mock_publisher_records() {
        let publisher = MockNotificationPublisher::new();
        publish_all(
            &publisher,
            vec![
                Notification::new("a", NotificationKind::MatchFound, json!({})),
                Notification::new("b", NotificationKind::MatchFound, json!({})),
                Notification::new("a", NotificationKind::RankUp, json!({})),
            ],
        )
        .await;

        assert_eq!(publisher.count_of(NotificationKind::MatchFound), 2);
        assert_eq!(publisher.notifications_for("a").len(), 2);

        publisher.clear();
        assert!(publisher.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_publish_all_swallows_failures() {
        // Must not panic or short-circuit.
        publish_all(
            &FailingPublisher,
            vec![
                Notification::new("a", NotificationKind::Reminder, json!({})),
                Notification::new("b", NotificationKind::Reminder, json!({})),
            ],
        )
        .await;
    }
}
