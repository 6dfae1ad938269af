// src/rabbitmq/topology.rs
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use tracing::{debug, info};

use crate::errors::{RabRpcError, Result};
use crate::transform::{ExchangeType, ExpandedConfig};

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
        }
    }
}

/// Declare every exchange, queue and binding of `config` on `channel`.
pub async fn declare(channel: &Channel, config: &ExpandedConfig) -> Result<()> {
    for exchange in &config.exchanges {
        channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.into(),
                ExchangeDeclareOptions {
                    durable: exchange.durable.unwrap_or(true),
                    auto_delete: exchange.auto_delete.unwrap_or(false),
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabRpcError::Channel(format!(
                    "Failed to declare exchange '{}': {}",
                    exchange.name, e
                ))
            })?;
        debug!(exchange = %exchange.name, kind = ?exchange.kind, "Exchange declared");
    }

    for queue in &config.queues {
        let declared = channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable.unwrap_or(true),
                    auto_delete: queue.auto_delete.unwrap_or(false),
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabRpcError::Channel(format!("Failed to declare queue '{}': {}", queue.name, e))
            })?;
        debug!(queue = %queue.name, messages = declared.message_count(), "Queue declared");
    }

    for binding in &config.bindings {
        for key in binding.keys() {
            channel
                .queue_bind(
                    &binding.target,
                    &binding.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    RabRpcError::Channel(format!(
                        "Failed to bind queue '{}' to '{}': {}",
                        binding.target, binding.exchange, e
                    ))
                })?;
        }
    }

    info!(
        exchanges = config.exchanges.len(),
        queues = config.queues.len(),
        bindings = config.bindings.len(),
        "Topology declared"
    );
    Ok(())
}
