// src/rabbitmq/mod.rs
// RabbitMQ implementation of the broker boundary

pub mod connection;
pub mod channel_manager;

mod broker;
mod consumer;
mod request_response;
mod topology;

pub use broker::RabbitBroker;
pub use connection::{ConnectionManager, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_RETRY_LIMIT};
pub use request_response::DIRECT_REPLY_QUEUE;
