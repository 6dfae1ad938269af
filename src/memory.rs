//! In-process broker.
//!
//! Routes published messages through the configured exchanges, bindings and
//! queues without a RabbitMQ server. Subscribed queues deliver to the handler
//! registry on spawned tasks, requeued messages are redelivered, and request
//! replies travel over in-process channels.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::broker::{Broker, OutgoingMessage, DEFAULT_CONNECTION};
use crate::errors::{RabRpcError, Result};
use crate::handler::{MessageControl, RawHandler, RawMessage, Reply};
use crate::registry::{HandlerRegistry, Subscription};
use crate::transform::{
    Binding, Exchange, ExchangeType, ExpandedConfig, DEFAULT_REPLY_TIMEOUT_MS,
};

/// How many published messages `MemoryBroker::published` remembers.
const PUBLISHED_HISTORY: usize = 1024;

type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Reply>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Envelope {
    topic: String,
    body: Value,
    reply: Option<ReplySlot>,
}

struct QueueState {
    consuming: bool,
    parked: Vec<Envelope>,
    /// Delivered before any handler for their topic was registered.
    awaiting_handler: Vec<Envelope>,
}

struct Topology {
    config: ExpandedConfig,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueState>,
}

impl Topology {
    fn new(config: ExpandedConfig) -> Self {
        let exchanges = config
            .exchanges
            .iter()
            .map(|exchange| (exchange.name.clone(), exchange.clone()))
            .collect();
        let queues = config
            .queues
            .iter()
            .map(|queue| {
                (
                    queue.name.clone(),
                    QueueState {
                        consuming: queue.subscribe,
                        parked: Vec::new(),
                        awaiting_handler: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            config,
            exchanges,
            queues,
        }
    }

    fn routes<'a>(
        &'a self,
        exchange: &'a Exchange,
        routing_key: &'a str,
    ) -> impl Iterator<Item = &'a Binding> {
        self.config
            .bindings
            .iter()
            .filter(move |binding| binding.exchange == exchange.name)
            .filter(move |binding| match exchange.kind {
                ExchangeType::Fanout => true,
                ExchangeType::Direct => binding.keys().any(|key| key == routing_key),
                ExchangeType::Topic => binding.keys().any(|key| topic_matches(key, routing_key)),
            })
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(segment)) if word == segment => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// Delivery counters, mostly useful in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub acked: usize,
    pub requeued: usize,
    pub rejected: usize,
    pub unhandled: usize,
}

#[derive(Default)]
struct MemoryInner {
    registry: HandlerRegistry,
    connections: Mutex<HashMap<String, Topology>>,
    pending_failure: Mutex<Option<String>>,
    refuse_next: Mutex<bool>,
    published: Mutex<VecDeque<(String, OutgoingMessage)>>,
    stats: Mutex<DeliveryStats>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `configure` fail with `reason`, the way a client
    /// reporting a bare string would.
    pub fn fail_next_configure(&self, reason: impl Into<String>) {
        *lock(&self.inner.pending_failure) = Some(reason.into());
    }

    /// Negatively confirm the next published message.
    pub fn refuse_next_publish(&self) {
        *lock(&self.inner.refuse_next) = true;
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner.registry.count(topic)
    }

    /// The most recent published messages, oldest first.
    pub fn published(&self) -> Vec<(String, OutgoingMessage)> {
        lock(&self.inner.published).iter().cloned().collect()
    }

    pub fn stats(&self) -> DeliveryStats {
        *lock(&self.inner.stats)
    }

    pub fn is_connected(&self, connection: &str) -> bool {
        lock(&self.inner.connections).contains_key(connection)
    }

    pub fn configuration(&self, connection: &str) -> Option<ExpandedConfig> {
        lock(&self.inner.connections)
            .get(connection)
            .map(|topology| topology.config.clone())
    }

    /// Messages waiting on `queue`, either because nobody consumes it or
    /// because no handler for their topic is registered yet.
    pub fn parked(&self, queue: &str) -> usize {
        lock(&self.inner.connections)
            .values()
            .filter_map(|topology| topology.queues.get(queue))
            .map(|state| state.parked.len() + state.awaiting_handler.len())
            .sum()
    }
}

impl MemoryInner {
    fn record(&self, update: impl FnOnce(&mut DeliveryStats)) {
        update(&mut lock(&self.stats));
    }

    fn deliver(
        self: &Arc<Self>,
        connection: &str,
        queue: &str,
        envelope: Envelope,
        redelivered: bool,
    ) {
        let handler = {
            let mut connections = lock(&self.connections);
            let Some(state) = connections
                .get_mut(connection)
                .and_then(|topology| topology.queues.get_mut(queue))
            else {
                debug!(queue = %queue, "Queue is gone, dropping message");
                return;
            };
            if !state.consuming {
                state.parked.push(envelope);
                return;
            }

            // Looked up under the connections lock so `redeliver_waiting`
            // cannot miss a message held back here.
            match self.registry.lookup(&envelope.topic) {
                Some(handler) => handler,
                None => {
                    warn!(
                        topic = %envelope.topic,
                        queue = %queue,
                        "No handler for message yet, holding"
                    );
                    state.awaiting_handler.push(envelope);
                    drop(connections);
                    self.record(|stats| stats.unhandled += 1);
                    return;
                }
            }
        };

        self.record(|stats| stats.delivered += 1);
        let control = Arc::new(MemoryControl {
            broker: Arc::clone(self),
            connection: connection.to_string(),
            queue: queue.to_string(),
            envelope: envelope.clone(),
        });
        let message = RawMessage::new(envelope.topic, envelope.body, redelivered, control);
        tokio::spawn(handler(message));
    }

    /// Redeliver messages held back for `topic` now that it has a handler.
    fn redeliver_waiting(self: &Arc<Self>, topic: &str) {
        let waiting: Vec<(String, String, Envelope)> = {
            let mut connections = lock(&self.connections);
            let mut waiting = Vec::new();
            for (connection, topology) in connections.iter_mut() {
                for (queue, state) in topology.queues.iter_mut() {
                    let (ready, held): (Vec<_>, Vec<_>) =
                        std::mem::take(&mut state.awaiting_handler)
                            .into_iter()
                            .partition(|envelope| envelope.topic == topic);
                    state.awaiting_handler = held;
                    waiting.extend(
                        ready
                            .into_iter()
                            .map(|envelope| (connection.clone(), queue.clone(), envelope)),
                    );
                }
            }
            waiting
        };

        if !waiting.is_empty() {
            debug!(topic = %topic, count = waiting.len(), "Redelivering held messages");
        }
        for (connection, queue, envelope) in waiting {
            self.deliver(&connection, &queue, envelope, true);
        }
    }
}

struct MemoryControl {
    broker: Arc<MemoryInner>,
    connection: String,
    queue: String,
    envelope: Envelope,
}

#[async_trait]
impl MessageControl for MemoryControl {
    async fn ack(&self) -> Result<()> {
        self.broker.record(|stats| stats.acked += 1);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if requeue {
            self.broker.record(|stats| stats.requeued += 1);
            self.broker
                .deliver(&self.connection, &self.queue, self.envelope.clone(), true);
        } else {
            self.broker.record(|stats| stats.rejected += 1);
        }
        Ok(())
    }

    async fn reply(&self, reply: Reply) -> Result<()> {
        let sender = self
            .envelope
            .reply
            .as_ref()
            .and_then(|slot| lock(slot).take())
            .ok_or_else(|| RabRpcError::Publish("message has no reply address".to_string()))?;
        sender
            .send(reply)
            .map_err(|_| RabRpcError::Publish("requester is no longer waiting".to_string()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn configure(&self, config: ExpandedConfig) -> Result<()> {
        if let Some(reason) = lock(&self.inner.pending_failure).take() {
            return Err(RabRpcError::from(reason));
        }

        for binding in &config.bindings {
            if config.exchange(&binding.exchange).is_none() {
                return Err(RabRpcError::Channel(format!(
                    "binding references undeclared exchange '{}'",
                    binding.exchange
                )));
            }
            if !config.queues.iter().any(|queue| queue.name == binding.target) {
                return Err(RabRpcError::Channel(format!(
                    "binding references undeclared queue '{}'",
                    binding.target
                )));
            }
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_CONNECTION.to_string());
        info!(
            connection = %name,
            exchanges = config.exchanges.len(),
            queues = config.queues.len(),
            "Memory broker configured"
        );
        lock(&self.inner.connections).insert(name, Topology::new(config));
        Ok(())
    }

    fn handle(&self, topic: &str, handler: RawHandler) -> Subscription {
        let subscription = self.inner.registry.register(topic, handler);
        self.inner.redeliver_waiting(topic);
        subscription
    }

    async fn publish(&self, exchange: &str, message: OutgoingMessage) -> Result<Option<Reply>> {
        if std::mem::take(&mut *lock(&self.inner.refuse_next)) {
            warn!(exchange = %exchange, topic = %message.topic, "Refusing message");
            return Err(RabRpcError::NotDelivered(exchange.to_string()));
        }

        let (slot, receiver) = if message.expect_reply {
            let (sender, receiver) = oneshot::channel();
            let slot: ReplySlot = Arc::new(Mutex::new(Some(sender)));
            (Some(slot), Some(receiver))
        } else {
            (None, None)
        };

        let envelope = Envelope {
            topic: message.topic.clone(),
            body: message.body.clone(),
            reply: slot.clone(),
        };

        // Connections share one server, so every connection that declared
        // the exchange contributes its bindings.
        let (targets, reply_timeout) = {
            let connections = lock(&self.inner.connections);
            let mut declared_timeout = None;
            let mut targets: Vec<(String, String)> = Vec::new();
            for (name, topology) in connections.iter() {
                let Some(declared) = topology.exchanges.get(exchange) else {
                    continue;
                };
                declared_timeout = declared_timeout.or(Some(declared.reply_timeout));
                for binding in topology.routes(declared, &message.routing_key) {
                    // A queue declared on several connections is still one queue.
                    if !targets.iter().any(|(_, queue)| queue == &binding.target) {
                        targets.push((name.clone(), binding.target.clone()));
                    }
                }
            }

            let Some(declared_timeout) = declared_timeout else {
                return Err(RabRpcError::Publish(format!(
                    "exchange '{}' is not configured",
                    exchange
                )));
            };
            let reply_timeout = message.reply_timeout.unwrap_or_else(|| {
                Duration::from_millis(declared_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT_MS))
            });
            (targets, reply_timeout)
        };

        debug!(exchange = %exchange, topic = %message.topic, routes = targets.len(), "Publishing");
        {
            let mut published = lock(&self.inner.published);
            if published.len() == PUBLISHED_HISTORY {
                published.pop_front();
            }
            published.push_back((exchange.to_string(), message));
        }

        for (connection, queue) in targets {
            self.inner.deliver(&connection, &queue, envelope.clone(), false);
        }

        let Some(receiver) = receiver else {
            return Ok(None);
        };

        // `slot` stays alive here, so an unanswered request times out instead
        // of failing early.
        let reply = tokio::time::timeout(reply_timeout, receiver)
            .await
            .map_err(|_| RabRpcError::Timeout(reply_timeout))?
            .map_err(|_| RabRpcError::ReplyChannelClosed)?;
        drop(slot);
        Ok(Some(reply))
    }

    async fn close_all(&self, reset: bool) -> Result<()> {
        lock(&self.inner.connections).clear();
        if reset {
            self.inner.registry.clear();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.close_all(true).await
    }

    async fn stop_subscription(&self, queue: &str, connection: Option<&str>) -> Result<()> {
        let connection = connection.unwrap_or(DEFAULT_CONNECTION);
        let mut connections = lock(&self.inner.connections);
        let state = connections
            .get_mut(connection)
            .and_then(|topology| topology.queues.get_mut(queue))
            .filter(|state| state.consuming)
            .ok_or_else(|| {
                RabRpcError::Consume(format!(
                    "no subscription for queue '{}' on connection '{}'",
                    queue, connection
                ))
            })?;
        state.consuming = false;
        info!(queue = %queue, connection = %connection, "Subscription stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimplifiedConfig;
    use crate::handler::{make_handler, make_responder, Actions};
    use crate::transform::transform_config;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn configured(config: SimplifiedConfig) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.configure(transform_config(&config).unwrap()).await.unwrap();
        broker
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(!topic_matches("a.*.c", "a.b.b.c"));
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#.c", "a.b.c"));
        assert!(!topic_matches("a.b", "a.c"));
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_service_key() {
        let broker = configured(SimplifiedConfig::new("memory").recv("jobs")).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.handle(
            "v1.jobs.run",
            make_handler(move |payload: Value, _: Actions, _: String| {
                let tx = tx.clone();
                async move {
                    tx.send(payload)?;
                    Ok(())
                }
            }),
        );

        broker
            .publish(
                "send-recv.jobs",
                OutgoingMessage::new("jobs", "v1.jobs.run", json!({ "n": 1 })),
            )
            .await
            .unwrap();
        broker
            .publish(
                "send-recv.jobs",
                OutgoingMessage::new("other", "v1.jobs.run", json!({ "n": 2 })),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(json!({ "n": 1 })));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_exchange_is_a_publish_error() {
        let broker = configured(SimplifiedConfig::new("memory")).await;
        let err = broker
            .publish("send-recv.nowhere", OutgoingMessage::new("x", "v1.x.y", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, RabRpcError::Publish(_)));
    }

    #[tokio::test]
    async fn request_without_responder_times_out() {
        let broker = configured(SimplifiedConfig::new("memory").req("quiet")).await;
        let err = broker
            .publish(
                "req-res.quiet",
                OutgoingMessage::new("quiet", "v1.quiet.ping", json!(null))
                    .expecting_reply(Some(Duration::from_millis(30))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RabRpcError::Timeout(d) if d == Duration::from_millis(30)));
    }

    #[tokio::test]
    async fn request_gets_reply() {
        let broker = configured(SimplifiedConfig::new("memory").res("math")).await;
        broker.handle(
            "v1.math.double",
            make_responder(|n: i64, _: Actions, _: String| async move { Ok(n * 2) }),
        );

        let reply = broker
            .publish(
                "req-res.math",
                OutgoingMessage::new("math", "v1.math.double", json!(21)).expecting_reply(None),
            )
            .await
            .unwrap();
        assert_eq!(reply, Some(Reply::Ok(json!(42))));
    }

    #[tokio::test]
    async fn stopped_queue_parks_messages() {
        let broker = configured(SimplifiedConfig::new("memory").recv("jobs")).await;
        broker.stop_subscription("send-recv.jobs", None).await.unwrap();

        broker
            .publish("send-recv.jobs", OutgoingMessage::new("jobs", "v1.jobs.run", json!(1)))
            .await
            .unwrap();
        assert_eq!(broker.parked("send-recv.jobs"), 1);

        let err = broker.stop_subscription("send-recv.jobs", None).await.unwrap_err();
        assert!(matches!(err, RabRpcError::Consume(_)));
    }

    #[tokio::test]
    async fn unhandled_messages_are_held_until_a_handler_arrives() {
        let broker = configured(SimplifiedConfig::new("memory").recv("jobs")).await;
        broker
            .publish("send-recv.jobs", OutgoingMessage::new("jobs", "v1.jobs.none", json!(1)))
            .await
            .unwrap();
        assert_eq!(broker.stats().unhandled, 1);
        assert_eq!(broker.parked("send-recv.jobs"), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.handle(
            "v1.jobs.none",
            make_handler(move |payload: Value, _: Actions, _: String| {
                let tx = tx.clone();
                async move {
                    tx.send(payload)?;
                    Ok(())
                }
            }),
        );

        assert_eq!(rx.recv().await, Some(json!(1)));
        assert_eq!(broker.parked("send-recv.jobs"), 0);
    }

    #[tokio::test]
    async fn published_history_is_bounded() {
        let broker = configured(SimplifiedConfig::new("memory").send("jobs")).await;
        for n in 0..PUBLISHED_HISTORY + 5 {
            broker
                .publish("send-recv.jobs", OutgoingMessage::new("jobs", "v1.jobs.run", json!(n)))
                .await
                .unwrap();
        }

        let published = broker.published();
        assert_eq!(published.len(), PUBLISHED_HISTORY);
        assert_eq!(published[0].1.body, json!(5));
    }

    #[tokio::test]
    async fn refused_publish_is_not_delivered() {
        let broker = configured(SimplifiedConfig::new("memory").send("jobs")).await;
        broker.refuse_next_publish();

        let err = broker
            .publish("send-recv.jobs", OutgoingMessage::new("jobs", "v1.jobs.run", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RabRpcError::NotDelivered(ref e) if e == "send-recv.jobs"));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_is_a_connection_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_configure("connection refused");
        let config = transform_config(&SimplifiedConfig::new("memory")).unwrap();

        let err = broker.configure(config.clone()).await.unwrap_err();
        assert!(matches!(err, RabRpcError::Connection(ref r) if r == "connection refused"));
        assert!(broker.configure(config).await.is_ok());
    }

    #[tokio::test]
    async fn close_all_with_reset_drops_handlers() {
        let broker = configured(SimplifiedConfig::new("memory").recv("jobs")).await;
        broker.handle(
            "v1.jobs.run",
            make_handler(|_: Value, _: Actions, _: String| async { Ok(()) }),
        );

        broker.close_all(false).await.unwrap();
        assert!(!broker.is_connected(DEFAULT_CONNECTION));
        assert_eq!(broker.handler_count("v1.jobs.run"), 1);

        broker.close_all(true).await.unwrap();
        assert_eq!(broker.handler_count("v1.jobs.run"), 0);
    }
}
