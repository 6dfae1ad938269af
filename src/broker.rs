// src/broker.rs
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::errors::Result;
use crate::handler::{RawHandler, Reply};
use crate::registry::Subscription;
use crate::transform::ExpandedConfig;

/// Name used for connections whose config carries no name.
pub const DEFAULT_CONNECTION: &str = "default";

/// A message on its way to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub routing_key: String,
    /// Full topic, carried as the AMQP message type.
    pub topic: String,
    pub body: Value,
    pub persistent: bool,
    pub expect_reply: bool,
    /// Overrides the exchange's configured reply timeout.
    pub reply_timeout: Option<Duration>,
}

impl OutgoingMessage {
    pub fn new(routing_key: impl Into<String>, topic: impl Into<String>, body: Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            topic: topic.into(),
            body,
            persistent: true,
            expect_reply: false,
            reply_timeout: None,
        }
    }

    pub fn expecting_reply(mut self, timeout: Option<Duration>) -> Self {
        self.expect_reply = true;
        self.reply_timeout = timeout;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// The operations the facades need from a messaging client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect and declare the topology of `config`.
    async fn configure(&self, config: ExpandedConfig) -> Result<()>;

    /// Register a handler for messages of `topic`. Never invokes the handler.
    fn handle(&self, topic: &str, handler: RawHandler) -> Subscription;

    /// Publish to `exchange`. Resolves once the broker has confirmed the
    /// message; with `expect_reply` set it resolves with the reply instead.
    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> Result<Option<Reply>>;

    /// Close every connection; `reset` also forgets registered handlers.
    async fn close_all(&self, reset: bool) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    /// Stop consuming `queue` on the named connection (default connection
    /// when `None`).
    async fn stop_subscription(&self, queue: &str, connection: Option<&str>) -> Result<()>;
}
