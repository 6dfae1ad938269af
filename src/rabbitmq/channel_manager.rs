// src/rabbitmq/channel_manager.rs
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    Channel, Connection,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{RabRpcError, Result};

/// Prefetch for consumer channels whose queue sets no `limit`.
pub const DEFAULT_PREFETCH: u16 = 10;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            confirm_mode: false,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    /// Channel used for publishing, with confirms.
    pub fn publisher() -> Self {
        Self {
            confirm_mode: true,
            id: format!("publish-{}", &Uuid::new_v4().to_string()[..8]),
            ..Self::default()
        }
    }

    /// Channel consuming `queue`, bounded by `limit` unacked messages.
    pub fn consumer(queue: &str, limit: Option<u16>) -> Self {
        Self {
            prefetch_count: limit.unwrap_or(DEFAULT_PREFETCH),
            id: format!("consume-{}", queue),
            ..Self::default()
        }
    }
}

pub async fn open_channel(connection: &Connection, config: &ChannelConfig) -> Result<Channel> {
    debug!(
        channel_id = %config.id,
        prefetch = %config.prefetch_count,
        confirm = %config.confirm_mode,
        "Creating channel"
    );
    let channel = connection.create_channel().await?;

    if config.prefetch_count > 0 {
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabRpcError::Channel(format!("Failed to set QoS: {}", e)))?;
    }

    if config.confirm_mode {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RabRpcError::Channel(format!("Failed to enable confirm mode: {}", e)))?;
    }

    info!(channel_id = %config.id, "Channel created and configured successfully");
    Ok(channel)
}
