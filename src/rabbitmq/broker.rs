// src/rabbitmq/broker.rs
use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties, Channel, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{open_channel, ChannelConfig};
use super::connection::ConnectionManager;
use super::consumer::{start_consumer, ConsumerHandle};
use super::request_response::ReplyRouter;
use super::topology;
use crate::broker::{Broker, OutgoingMessage, DEFAULT_CONNECTION};
use crate::errors::{RabRpcError, Result};
use crate::handler::{RawHandler, Reply};
use crate::registry::{HandlerRegistry, Subscription};
use crate::transform::{ExpandedConfig, DEFAULT_REPLY_TIMEOUT_MS};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

struct LiveConnection {
    connection: Connection,
    publisher: Channel,
    replies: Arc<ReplyRouter>,
    /// Declared exchanges and their reply timeouts
    exchanges: HashMap<String, Option<u64>>,
    consumers: HashMap<String, ConsumerHandle>,
}

impl LiveConnection {
    async fn close(self, name: &str) {
        for (queue, consumer) in self.consumers {
            if let Err(e) = consumer.cancel().await {
                warn!(connection = %name, queue = %queue, error = %e, "Failed to cancel consumer");
            }
        }
        if let Err(e) = self.connection.close(200, "Closing connection").await {
            warn!(connection = %name, error = %e, "Failed to close connection cleanly");
        }
        info!(connection = %name, "Connection closed");
    }
}

/// `Broker` backed by a RabbitMQ server through lapin.
#[derive(Default)]
pub struct RabbitBroker {
    registry: HandlerRegistry,
    connections: Mutex<HashMap<String, LiveConnection>>,
}

impl RabbitBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, name: &str, config: &ExpandedConfig) -> Result<LiveConnection> {
        let connection = ConnectionManager::from_options(&config.connection, name)?
            .connect()
            .await?;

        match self.prepare(&connection, config).await {
            Ok((publisher, replies, consumers)) => Ok(LiveConnection {
                connection,
                publisher,
                replies,
                exchanges: config
                    .exchanges
                    .iter()
                    .map(|exchange| (exchange.name.clone(), exchange.reply_timeout))
                    .collect(),
                consumers,
            }),
            Err(e) => {
                if let Err(close_err) = connection.close(200, "Setup failed").await {
                    debug!(connection = %name, error = %close_err, "Connection already closed");
                }
                Err(e)
            }
        }
    }

    /// Declare the topology and start the reply router and consumers.
    async fn prepare(
        &self,
        connection: &Connection,
        config: &ExpandedConfig,
    ) -> Result<(Channel, Arc<ReplyRouter>, HashMap<String, ConsumerHandle>)> {
        let publisher = open_channel(connection, &ChannelConfig::publisher()).await?;
        topology::declare(&publisher, config).await?;

        let dedicated = config.connection.reply_queue.unwrap_or(true);
        let replies = Arc::new(ReplyRouter::start(&publisher, dedicated).await?);

        let mut consumers = HashMap::new();
        for queue in config.subscribed_queues() {
            let consumer = start_consumer(connection, queue, self.registry.clone()).await?;
            consumers.insert(queue.name.clone(), consumer);
        }

        Ok((publisher, replies, consumers))
    }
}

fn properties(message: &OutgoingMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_type(message.topic.clone().into())
        .with_message_id(Uuid::new_v4().to_string().into())
        .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64)
        .with_delivery_mode(if message.persistent { PERSISTENT } else { TRANSIENT })
}

#[async_trait]
impl Broker for RabbitBroker {
    async fn configure(&self, config: ExpandedConfig) -> Result<()> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_CONNECTION.to_string());

        // Only the swap below holds the lock. A failed open leaves the current
        // connection in place.
        let live = self.open(&name, &config).await?;
        info!(
            connection = %name,
            exchanges = live.exchanges.len(),
            consumers = live.consumers.len(),
            "RabbitMQ configured"
        );

        let previous = self.connections.lock().await.insert(name.clone(), live);
        if let Some(previous) = previous {
            info!(connection = %name, "Replaced existing connection");
            previous.close(&name).await;
        }
        Ok(())
    }

    fn handle(&self, topic: &str, handler: RawHandler) -> Subscription {
        self.registry.register(topic, handler)
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> Result<Option<Reply>> {
        let (publisher, replies, exchange_timeout) = {
            let connections = self.connections.lock().await;
            connections
                .values()
                .find_map(|live| {
                    live.exchanges.get(exchange).map(|timeout| {
                        (live.publisher.clone(), Arc::clone(&live.replies), *timeout)
                    })
                })
                .ok_or_else(|| {
                    RabRpcError::Publish(format!("exchange '{}' is not configured", exchange))
                })?
        };

        let payload = serde_json::to_vec(&message.body)?;
        let mut properties = properties(&message);
        let pending = message.expect_reply.then(|| replies.register());
        if let Some((correlation_id, _)) = &pending {
            properties = properties
                .with_correlation_id(correlation_id.clone().into())
                .with_reply_to(replies.queue().to_string().into());
        }

        let correlation = pending.as_ref().map(|(id, _)| id.clone());
        let forget = || {
            if let Some(correlation_id) = &correlation {
                replies.forget(correlation_id);
            }
        };

        debug!(exchange = %exchange, topic = %message.topic, "Publishing");

        let confirm = match publisher
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                forget();
                return Err(RabRpcError::Publish(e.to_string()));
            }
        };

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => {
                forget();
                warn!(exchange = %exchange, topic = %message.topic, "Broker refused message");
                return Err(RabRpcError::NotDelivered(exchange.to_string()));
            }
            Ok(_) => {}
            Err(e) => {
                forget();
                return Err(RabRpcError::Publish(e.to_string()));
            }
        }

        let Some((correlation_id, receiver)) = pending else {
            return Ok(None);
        };

        let reply_timeout = message.reply_timeout.unwrap_or_else(|| {
            Duration::from_millis(exchange_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT_MS))
        });
        match tokio::time::timeout(reply_timeout, receiver).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(RabRpcError::ReplyChannelClosed),
            Err(_) => {
                replies.forget(&correlation_id);
                error!(topic = %message.topic, timeout = ?reply_timeout, "Request timed out");
                Err(RabRpcError::Timeout(reply_timeout))
            }
        }
    }

    async fn close_all(&self, reset: bool) -> Result<()> {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (name, live) in drained {
            live.close(&name).await;
        }
        if reset {
            self.registry.clear();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down RabbitMQ connections");
        self.close_all(true).await
    }

    async fn stop_subscription(&self, queue: &str, connection: Option<&str>) -> Result<()> {
        let connection = connection.unwrap_or(DEFAULT_CONNECTION);
        let consumer = {
            let mut connections = self.connections.lock().await;
            connections
                .get_mut(connection)
                .and_then(|live| live.consumers.remove(queue))
                .ok_or_else(|| {
                    RabRpcError::Consume(format!(
                        "no subscription for queue '{}' on connection '{}'",
                        queue, connection
                    ))
                })?
        };
        consumer.cancel().await
    }
}
