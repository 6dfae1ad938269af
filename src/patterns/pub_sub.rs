// src/patterns/pub_sub.rs
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

/// Broadcast `payload` to every subscriber of the topic's service.
pub async fn publish<P>(
    broker: &dyn Broker,
    topic: &str,
    payload: &P,
    options: &CallOptions,
) -> Result<()>
where
    P: Serialize + ?Sized,
{
    fire(broker, PatternKind::Publish, topic, payload, options).await
}

/// Handle messages published on `topic`. Registration never calls `handler`.
pub fn subscribe<P, F, Fut>(broker: &dyn Broker, topic: &str, handler: F) -> Result<Subscription>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let parsed = Topic::parse(topic)?;
    info!(topic = %topic, exchange = %parsed.exchange(PatternKind::Subscribe), "Subscribing");
    Ok(broker.handle(parsed.as_str(), make_handler(handler)))
}
