//! AMQP integration for the ranked service
//!
//! Player commands arrive on a durable queue and notifications leave through
//! a topic exchange, one routing key per notification kind.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

// Re-export commonly used types
pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{CommandConsumer, CommandHandler, MockCommandHandler};
pub use messages::*;
pub use publisher::{
    publish_all, AmqpNotificationPublisher, MockNotificationPublisher, NotificationPublisher,
    PublisherConfig,
};
