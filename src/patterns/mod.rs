//! The six messaging operations, expressed over a [`Broker`].
//!
//! Each function takes the broker explicitly; [`crate::RabRpc`] binds them to
//! its own broker handle.

pub mod pub_sub;
pub mod req_res;
pub mod send_recv;

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::broker::{Broker, OutgoingMessage};
use crate::errors::Result;
use crate::topic::Topic;
use crate::transform::PatternKind;

/// Per-call publishing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Overrides the exchange's reply timeout for requests.
    pub reply_timeout: Option<Duration>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            reply_timeout: None,
            persistent: true,
        }
    }
}

impl CallOptions {
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// Build the exchange name and message for publishing `payload` on `topic`.
pub(crate) fn outgoing<P>(
    kind: PatternKind,
    topic: &str,
    payload: &P,
    options: &CallOptions,
) -> Result<(String, OutgoingMessage)>
where
    P: Serialize + ?Sized,
{
    let parsed = Topic::parse(topic)?;
    let body = serde_json::to_value(payload)?;
    let mut message = OutgoingMessage::new(parsed.service(), parsed.as_str(), body)
        .persistent(options.persistent);
    if kind.expects_reply() {
        message = message.expecting_reply(options.reply_timeout);
    }
    Ok((parsed.exchange(kind), message))
}

/// Publish without waiting for a reply.
pub(crate) async fn fire<P>(
    broker: &dyn Broker,
    kind: PatternKind,
    topic: &str,
    payload: &P,
    options: &CallOptions,
) -> Result<()>
where
    P: Serialize + ?Sized,
{
    let (exchange, message) = outgoing(kind, topic, payload, options)?;
    broker.publish(&exchange, message).await?;
    debug!(exchange = %exchange, topic = %topic, "Message confirmed");
    Ok(())
}
