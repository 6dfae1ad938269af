//! Convenience layer over AMQP messaging.
//!
//! A short-hand configuration (`req`, `res`, `send`, `recv`, `pub`, `sub`) is
//! expanded into exchanges, queues and bindings, and six operations cover the
//! request/respond, send/receive and publish/subscribe patterns:
//!
//! ```no_run
//! use rabrpc::{Actions, RabRpc, SimplifiedConfig};
//! use serde_json::Value;
//!
//! # async fn run() -> rabrpc::Result<()> {
//! let rpc = RabRpc::rabbitmq();
//! rpc.configure(&SimplifiedConfig::new("amqp://localhost").recv("jobs")).await?;
//!
//! rpc.receive("v1.jobs.run", |job: Value, _: Actions, topic: String| async move {
//!     println!("{topic}: {job}");
//!     Ok(())
//! })?;
//! rpc.send("v1.jobs.run", &serde_json::json!({ "id": 1 })).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod env;
pub mod errors;
pub mod handler;
pub mod memory;
pub mod patterns;
pub mod rabbitmq;
pub mod registry;
pub mod topic;
pub mod transform;

mod rab_rpc;

pub use broker::{Broker, OutgoingMessage, DEFAULT_CONNECTION};
pub use config::{
    ConnectionConfig, ConnectionOptions, PatternEntry, ServiceOptions, SimplifiedConfig,
};
pub use errors::{RabRpcError, Result};
pub use handler::{
    make_handler, make_responder, Actions, MessageControl, RawHandler, RawMessage, Reply,
};
pub use memory::MemoryBroker;
pub use patterns::CallOptions;
pub use rab_rpc::RabRpc;
pub use rabbitmq::RabbitBroker;
pub use registry::{HandlerRegistry, Subscription};
pub use topic::Topic;
pub use transform::{transform_config, transform_value, ExpandedConfig, PatternKind};
