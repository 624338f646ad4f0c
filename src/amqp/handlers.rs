//! AMQP consumer for player commands
//!
//! Deliveries on the command queue are decoded into [`EngineCommand`]s and
//! handed to a [`CommandHandler`]. Every delivery is acked once handled;
//! commands that fail are reported back to the player by the handler, so a
//! redelivery would only repeat the rejection.

use crate::amqp::messages::{EngineCommand, MessageUtils};
use crate::error::{EngineError, Result};
use amqprs::{
    channel::{BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Receives decoded commands from the consumer
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a single player command
    async fn handle_command(&self, command: EngineCommand) -> Result<()>;

    /// Handle a delivery that could not be decoded or processed
    async fn handle_error(&self, error: EngineError, message_data: &[u8]);
}

/// Consumer bound to the command queue
pub struct CommandConsumer {
    handler: Arc<dyn CommandHandler>,
    channel: Channel,
    consumer_tag: String,
}

impl CommandConsumer {
    pub fn new(handler: Arc<dyn CommandHandler>, channel: Channel) -> Self {
        let consumer_tag = format!("ranked-commands-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Start consuming messages from the queue
    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);

        self.channel
            .basic_consume(DeliveryConsumer::new(self.handler.clone()), args)
            .await
            .map_err(|e| EngineError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming commands from queue: {}", queue_name);
        Ok(())
    }

    /// Stop consuming messages
    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel
            .basic_cancel(args)
            .await
            .map_err(|e| EngineError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            })?;

        info!("Stopped consuming commands");
        Ok(())
    }
}

struct DeliveryConsumer {
    handler: Arc<dyn CommandHandler>,
}

impl DeliveryConsumer {
    fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl AsyncConsumer for DeliveryConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        debug!(
            "Command received - delivery_tag: {}, size: {} bytes",
            delivery_tag,
            content.len()
        );

        let start_time = std::time::Instant::now();
        match process_delivery(self.handler.as_ref(), &content).await {
            Ok(()) => {
                debug!(
                    "Command processed - delivery_tag: {}, processing_time: {:.2}ms",
                    delivery_tag,
                    start_time.elapsed().as_secs_f64() * 1000.0
                );
            }
            Err(e) => {
                warn!(
                    "Command failed - delivery_tag: {}, processing_time: {:.2}ms, error: {}",
                    delivery_tag,
                    start_time.elapsed().as_secs_f64() * 1000.0,
                    e
                );
                self.handler.handle_error(e, &content).await;
            }
        }

        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            error!("Failed to ack delivery {}: {}", delivery_tag, e);
        }
    }
}

/// Decode one delivery and pass it to the handler
pub async fn process_delivery(handler: &dyn CommandHandler, content: &[u8]) -> Result<()> {
    let command = MessageUtils::deserialize_command(content)?;
    debug!(
        "Dispatching {} from {}",
        command.name(),
        command.issuer().unwrap_or("system")
    );
    handler.handle_command(command).await
}

/// Recording handler for tests
#[derive(Default)]
pub struct MockCommandHandler {
    commands: Mutex<Vec<EngineCommand>>,
    errors: Mutex<Vec<String>>,
}

impl MockCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<EngineCommand> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandHandler for MockCommandHandler {
    async fn handle_command(&self, command: EngineCommand) -> Result<()> {
        let mut commands = self
            .commands
            .lock()
            .map_err(|_| EngineError::internal("Failed to acquire commands lock"))?;
        commands.push(command);
        Ok(())
    }

    async fn handle_error(&self, error: EngineError, _message_data: &[u8]) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.to_string());
        }
    }
}
