//! Adapters between raw broker deliveries and application handlers.
//!
//! Application handlers are plain async functions of
//! `(payload, actions, topic)`. The wrappers here decode the payload, settle
//! the message according to the outcome and, on the respond side, publish the
//! reply.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::errors::Result;

/// Outcome of a request as it travels back to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "lowercase")]
pub enum Reply {
    Ok(Value),
    Error(String),
}

/// Settlement operations on a single delivery, implemented by each broker.
#[async_trait]
pub trait MessageControl: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;

    /// Send `reply` to the message's reply address.
    async fn reply(&self, reply: Reply) -> Result<()>;
}

/// A delivery as handed over by the broker.
pub struct RawMessage {
    pub topic: String,
    pub body: Value,
    pub redelivered: bool,
    control: Arc<dyn MessageControl>,
}

impl RawMessage {
    pub fn new(
        topic: impl Into<String>,
        body: Value,
        redelivered: bool,
        control: Arc<dyn MessageControl>,
    ) -> Self {
        Self {
            topic: topic.into(),
            body,
            redelivered,
            control,
        }
    }

    pub fn control(&self) -> Arc<dyn MessageControl> {
        Arc::clone(&self.control)
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("topic", &self.topic)
            .field("body", &self.body)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Acknowledgement operations handed to application handlers.
///
/// A message is settled at most once; later calls are no-ops.
#[derive(Clone)]
pub struct Actions {
    control: Arc<dyn MessageControl>,
    settled: Arc<AtomicBool>,
}

impl Actions {
    pub fn new(control: Arc<dyn MessageControl>) -> Self {
        Self {
            control,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn claim(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<()> {
        if self.claim() {
            self.control.ack().await?;
        }
        Ok(())
    }

    /// Drop the message without redelivery.
    pub async fn reject(&self) -> Result<()> {
        if self.claim() {
            self.control.nack(false).await?;
        }
        Ok(())
    }

    /// Return the message to the queue for redelivery.
    pub async fn requeue(&self) -> Result<()> {
        if self.claim() {
            self.control.nack(true).await?;
        }
        Ok(())
    }

    pub async fn nack(&self) -> Result<()> {
        self.requeue().await
    }
}

impl fmt::Debug for Actions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actions")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Type-erased handler stored by brokers.
pub type RawHandler = Arc<dyn Fn(RawMessage) -> BoxFuture<'static, ()> + Send + Sync>;

enum Outcome<T> {
    Completed(T),
    Failed(String),
    Undecodable(String),
}

async fn invoke<P, T, F, Fut>(handler: &F, message: RawMessage, actions: Actions) -> Outcome<T>
where
    P: DeserializeOwned,
    F: Fn(P, Actions, String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let payload: P = match serde_json::from_value(message.body) {
        Ok(payload) => payload,
        Err(e) => return Outcome::Undecodable(e.to_string()),
    };

    let topic = message.topic;
    let call = AssertUnwindSafe(async move { handler(payload, actions, topic).await });
    match call.catch_unwind().await {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
        Err(_) => Outcome::Failed("handler panicked".to_string()),
    }
}

/// Wrap a receive/subscribe handler.
///
/// Success acknowledges the message (unless the handler already settled it),
/// failure or panic requeues it and leaves redelivery to the broker.
pub fn make_handler<P, F, Fut>(handler: F) -> RawHandler
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |message: RawMessage| {
        let handler = Arc::clone(&handler);
        async move {
            let topic = message.topic.clone();
            let actions = Actions::new(message.control());

            let settled = match invoke(handler.as_ref(), message, actions.clone()).await {
                Outcome::Completed(()) => actions.ack().await,
                Outcome::Failed(reason) => {
                    error!(topic = %topic, error = %reason, "Handler failed, requeueing message");
                    actions.requeue().await
                }
                Outcome::Undecodable(reason) => {
                    warn!(topic = %topic, error = %reason, "Rejecting message with undecodable payload");
                    actions.reject().await
                }
            };

            if let Err(e) = settled {
                error!(topic = %topic, error = %e, "Failed to settle message");
            }
        }
        .boxed()
    })
}

/// Wrap a respond handler.
///
/// The handler's value is replied as a success and its error (or panic) as a
/// failure; the request itself is then acknowledged.
pub fn make_responder<P, R, F, Fut>(handler: F) -> RawHandler
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |message: RawMessage| {
        let handler = Arc::clone(&handler);
        async move {
            let topic = message.topic.clone();
            let control = message.control();
            let actions = Actions::new(Arc::clone(&control));

            let reply = match invoke(handler.as_ref(), message, actions.clone()).await {
                Outcome::Completed(value) => match serde_json::to_value(value) {
                    Ok(value) => Reply::Ok(value),
                    Err(e) => Reply::Error(format!("failed to serialize reply: {}", e)),
                },
                Outcome::Failed(reason) => {
                    warn!(topic = %topic, error = %reason, "Responder failed, replying with error");
                    Reply::Error(reason)
                }
                Outcome::Undecodable(reason) => {
                    Reply::Error(format!("invalid request payload: {}", reason))
                }
            };

            match control.reply(reply).await {
                Ok(()) => debug!(topic = %topic, "Reply sent"),
                Err(e) => error!(topic = %topic, error = %e, "Failed to send reply"),
            }

            if let Err(e) = actions.ack().await {
                error!(topic = %topic, error = %e, "Failed to acknowledge request");
            }
        }
        .boxed()
    })
}
