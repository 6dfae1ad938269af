// src/patterns/req_res.rs
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use tracing::{debug, info};

use super::{outgoing, CallOptions};
use crate::broker::Broker;
use crate::errors::{RabRpcError, Result};
use crate::handler::{make_responder, Actions, Reply};
use crate::registry::Subscription;
use crate::topic::Topic;
use crate::transform::PatternKind;

/// Send a request and wait for the responder's reply.
///
/// A failure reported by the responder surfaces as [`RabRpcError::Request`].
pub async fn request<P, R>(
    broker: &dyn Broker,
    topic: &str,
    payload: &P,
    options: &CallOptions,
) -> Result<R>
where
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let (exchange, message) = outgoing(PatternKind::Request, topic, payload, options)?;
    match broker.publish(&exchange, message).await? {
        Some(Reply::Ok(value)) => {
            debug!(topic = %topic, "Reply received");
            Ok(serde_json::from_value(value)?)
        }
        Some(Reply::Error(reason)) => Err(RabRpcError::Request(reason)),
        None => Err(RabRpcError::ReplyChannelClosed),
    }
}

/// Answer requests sent to `topic` with the handler's result.
pub fn respond<P, R, F, Fut>(broker: &dyn Broker, topic: &str, handler: F) -> Result<Subscription>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let parsed = Topic::parse(topic)?;
    info!(topic = %topic, queue = %parsed.exchange(PatternKind::Respond), "Responding");
    Ok(broker.handle(parsed.as_str(), make_responder(handler)))
}
