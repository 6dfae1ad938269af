// src/patterns/send_recv.rs
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use tracing::info;

use super::{fire, CallOptions};
use crate::broker::Broker;
use crate::errors::Result;
use crate::handler::{make_handler, Actions};
use crate::registry::Subscription;
use crate::topic::Topic;
use crate::transform::PatternKind;

/// Send `payload` to the single consumer group of the topic's service.
pub async fn send<P>(
    broker: &dyn Broker,
    topic: &str,
    payload: &P,
    options: &CallOptions,
) -> Result<()>
where
    P: Serialize + ?Sized,
{
    fire(broker, PatternKind::Send, topic, payload, options).await
}

/// Handle messages sent to `topic`.
pub fn receive<P, F, Fut>(broker: &dyn Broker, topic: &str, handler: F) -> Result<Subscription>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let parsed = Topic::parse(topic)?;
    info!(topic = %topic, queue = %parsed.exchange(PatternKind::Receive), "Receiving");
    Ok(broker.handle(parsed.as_str(), make_handler(handler)))
}
