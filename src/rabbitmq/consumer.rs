// src/rabbitmq/consumer.rs
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicRejectOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{open_channel, ChannelConfig};
use crate::errors::{RabRpcError, Result};
use crate::handler::{MessageControl, RawMessage, Reply};
use crate::registry::HandlerRegistry;
use crate::transform::Queue;

const UNHANDLED_REQUEUE_DELAY: Duration = Duration::from_millis(500);

/// Settlement of one lapin delivery.
struct LapinControl {
    acker: Acker,
    channel: Channel,
    reply_to: Option<ShortString>,
    correlation_id: Option<ShortString>,
}

#[async_trait]
impl MessageControl for LapinControl {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RabRpcError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| RabRpcError::Ack(e.to_string()))
    }

    async fn reply(&self, reply: Reply) -> Result<()> {
        let reply_to = self
            .reply_to
            .as_ref()
            .ok_or_else(|| RabRpcError::Publish("request has no reply_to".to_string()))?;

        let mut properties =
            BasicProperties::default().with_content_type("application/json".into());
        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone());
        }

        let payload = serde_json::to_vec(&reply)?;
        self.channel
            .basic_publish(
                "",
                reply_to.as_str(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| RabRpcError::Publish(format!("Failed to publish reply: {}", e)))?;
        Ok(())
    }
}

/// Topic of a delivery: the message type, falling back to the routing key.
fn delivery_topic(delivery: &Delivery) -> String {
    delivery
        .properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_string())
        .unwrap_or_else(|| delivery.routing_key.as_str().to_string())
}

/// A running consumer on one queue.
pub struct ConsumerHandle {
    queue: String,
    tag: String,
    channel: Channel,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub async fn cancel(self) -> Result<()> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabRpcError::Consume(format!("Failed to cancel consumer: {}", e)))?;
        if let Err(e) = self.channel.close(200, "Subscription stopped").await {
            debug!(queue = %self.queue, error = %e, "Channel already closed");
        }
        self.task.abort();
        info!(queue = %self.queue, "Stopped consuming");
        Ok(())
    }
}

/// Consume `queue` on its own channel and dispatch deliveries through
/// `registry`.
pub async fn start_consumer(
    connection: &Connection,
    queue: &Queue,
    registry: HandlerRegistry,
) -> Result<ConsumerHandle> {
    let config = ChannelConfig::consumer(&queue.name, queue.limit);
    let channel = open_channel(connection, &config).await?;
    let tag = format!("consumer-{}", Uuid::new_v4());

    let mut consumer = channel
        .basic_consume(
            &queue.name,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| RabRpcError::Consume(format!("Failed to consume '{}': {}", queue.name, e)))?;

    info!(queue = %queue.name, "Started consuming");

    let reply_channel = channel.clone();
    let queue_name = queue.name.clone();
    let task = tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => dispatch(&registry, &reply_channel, delivery).await,
                Err(e) => {
                    error!(queue = %queue_name, error = %e, "Error receiving message");
                    if !reply_channel.status().connected() {
                        warn!(queue = %queue_name, "Channel disconnected, consumer stopping");
                        break;
                    }
                }
            }
        }
    });

    Ok(ConsumerHandle {
        queue: queue.name.clone(),
        tag,
        channel,
        task,
    })
}

async fn dispatch(registry: &HandlerRegistry, channel: &Channel, delivery: Delivery) {
    let topic = delivery_topic(&delivery);

    let Some(handler) = registry.lookup(&topic) else {
        warn!(topic = %topic, "No handler for message yet, requeueing");
        requeue_later(delivery.acker.clone());
        return;
    };

    let body: Value = match serde_json::from_slice(&delivery.data) {
        Ok(body) => body,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Rejecting message that is not JSON");
            reject(&delivery.acker).await;
            return;
        }
    };

    let control = Arc::new(LapinControl {
        acker: delivery.acker.clone(),
        channel: channel.clone(),
        reply_to: delivery.properties.reply_to().clone(),
        correlation_id: delivery.properties.correlation_id().clone(),
    });
    let message = RawMessage::new(topic, body, delivery.redelivered, control);
    tokio::spawn(handler(message));
}

/// Hands an unhandled delivery back to the queue after a pause, so a handler
/// registered after `configure` still sees the backlog.
fn requeue_later(acker: Acker) {
    tokio::spawn(async move {
        tokio::time::sleep(UNHANDLED_REQUEUE_DELAY).await;
        let options = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        };
        if let Err(e) = acker.nack(options).await {
            error!(error = %e, "Failed to requeue message");
        }
    });
}

async fn reject(acker: &Acker) {
    if let Err(e) = acker.reject(BasicRejectOptions { requeue: false }).await {
        error!(error = %e, "Failed to reject message");
    }
}
