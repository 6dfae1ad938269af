// src/rabbitmq/request_response.rs
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{RabRpcError, Result};
use crate::handler::Reply;

/// RabbitMQ's pseudo-queue for replies without a declared queue.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

fn lock(pending: &PendingReplies) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes replies back to waiting requesters by correlation id.
pub struct ReplyRouter {
    queue: String,
    pending: PendingReplies,
}

impl ReplyRouter {
    /// Start consuming replies on `channel`, which must also be the channel
    /// requests are published on when using direct reply-to.
    ///
    /// With `dedicated` set, an exclusive auto-deleted queue is declared for
    /// replies instead.
    pub async fn start(channel: &Channel, dedicated: bool) -> Result<Self> {
        let queue = if dedicated {
            let declared = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    RabRpcError::Channel(format!("Failed to declare reply queue: {}", e))
                })?;
            declared.name().as_str().to_string()
        } else {
            DIRECT_REPLY_QUEUE.to_string()
        };

        let mut consumer = channel
            .basic_consume(
                &queue,
                &format!("replies-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabRpcError::Consume(format!("Failed to consume replies: {}", e)))?;

        info!(queue = %queue, "Listening for replies");

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => route_reply(&routes, delivery),
                    Err(e) => {
                        error!(error = %e, "Error receiving reply");
                        break;
                    }
                }
            }
            debug!("Reply consumer stopped");
            // Wake every waiter; they observe a closed reply channel.
            lock(&routes).clear();
        });

        Ok(Self { queue, pending })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Reserve a correlation id and the receiver its reply will arrive on.
    pub fn register(&self) -> (String, oneshot::Receiver<Reply>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(correlation_id.clone(), sender);
        (correlation_id, receiver)
    }

    /// Drop the waiter for `correlation_id`, e.g. after a timeout.
    pub fn forget(&self, correlation_id: &str) {
        lock(&self.pending).remove(correlation_id);
    }
}

fn route_reply(pending: &PendingReplies, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id().as_ref() else {
        warn!("Dropping reply without correlation id");
        return;
    };

    let Some(sender) = lock(pending).remove(correlation_id.as_str()) else {
        debug!(correlation_id = %correlation_id, "No requester waiting for reply");
        return;
    };

    let reply = decode_reply(&delivery.data);
    if sender.send(reply).is_err() {
        debug!(correlation_id = %correlation_id, "Requester gave up before the reply arrived");
    }
}

fn decode_reply(data: &[u8]) -> Reply {
    serde_json::from_slice(data)
        .unwrap_or_else(|e| Reply::Error(format!("malformed reply: {}", e)))
}
