// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabRpcError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ unreachable after {attempts} attempts: {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("Invalid topic '{0}': expected <version>.<service>.<action>")]
    InvalidTopic(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("Message was not delivered to exchange '{0}'")]
    NotDelivered(String),

    #[error("RabbitMQ consume error: {0}")]
    Consume(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Reply channel was closed before a response arrived")]
    ReplyChannelClosed,

    #[error("Request failed: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, RabRpcError>;

impl RabRpcError {
    /// The broker gave up reconnecting; retrying from the caller will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RabRpcError::Unreachable { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RabRpcError::Configuration(_) | RabRpcError::InvalidTopic(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabRpcError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("connection") {
            RabRpcError::Connection(error_text)
        } else if error_text.contains("channel") {
            RabRpcError::Channel(error_text)
        } else if error_text.contains("publish") {
            RabRpcError::Publish(error_text)
        } else if error_text.contains("consume") {
            RabRpcError::Consume(error_text)
        } else if error_text.contains("ack") || error_text.contains("nack") {
            RabRpcError::Ack(error_text)
        } else {
            RabRpcError::Channel(error_text)
        }
    }
}

// Broker clients that fail with a bare reason string are reporting a
// connection problem.
impl From<String> for RabRpcError {
    fn from(reason: String) -> Self {
        RabRpcError::Connection(reason)
    }
}

impl From<&str> for RabRpcError {
    fn from(reason: &str) -> Self {
        RabRpcError::Connection(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_strings_become_connection_errors() {
        let err: RabRpcError = "ECONNREFUSED".into();
        assert!(matches!(err, RabRpcError::Connection(ref reason) if reason == "ECONNREFUSED"));

        let err: RabRpcError = String::from("No endpoints could be reached").into();
        assert_eq!(
            err.to_string(),
            "RabbitMQ connection error: No endpoints could be reached"
        );
    }

    #[test]
    fn only_unreachable_is_fatal() {
        let unreachable = RabRpcError::Unreachable {
            attempts: 3,
            reason: "refused".into(),
        };
        assert!(unreachable.is_fatal());
        assert!(!RabRpcError::Connection("refused".into()).is_fatal());
        assert!(!RabRpcError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn topic_errors_count_as_configuration_errors() {
        assert!(RabRpcError::InvalidTopic("nope".into()).is_configuration());
        assert!(RabRpcError::Configuration("missing".into()).is_configuration());
        assert!(!RabRpcError::ReplyChannelClosed.is_configuration());
    }
}
