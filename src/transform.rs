//! Expansion of the short-hand configuration into exchanges, queues and
//! bindings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConnectionOptions, OneOrMany, ServiceOptions, SimplifiedConfig};
use crate::errors::{RabRpcError, Result};

pub const REQ_RES_PREFIX: &str = "req-res.";
pub const SEND_RECV_PREFIX: &str = "send-recv.";
pub const PUB_SUB_PREFIX: &str = "pub-sub.";

/// Reply timeout applied to request/respond exchanges, in milliseconds.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub name: String,
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
    /// Consumer prefetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub target: String,
    pub keys: OneOrMany<String>,
}

impl Binding {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// Topology and connection settings in the shape the broker layer consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub queues: Vec<Queue>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl ExpandedConfig {
    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.iter().find(|exchange| exchange.name == name)
    }

    pub fn subscribed_queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.iter().filter(|queue| queue.subscribe)
    }

    fn add_exchange(&mut self, exchange: Exchange) {
        if self.exchange(&exchange.name).is_none() {
            self.exchanges.push(exchange);
        }
    }

    fn add_queue(&mut self, queue: Queue) {
        if !self.queues.iter().any(|existing| existing.name == queue.name) {
            self.queues.push(queue);
        }
    }

    fn add_binding(&mut self, binding: Binding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }
}

/// Which side of which messaging pattern a config key describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Request,
    Respond,
    Send,
    Receive,
    Publish,
    Subscribe,
}

impl PatternKind {
    /// Processing order of the config keys.
    pub const ALL: [PatternKind; 6] = [
        PatternKind::Request,
        PatternKind::Respond,
        PatternKind::Send,
        PatternKind::Receive,
        PatternKind::Publish,
        PatternKind::Subscribe,
    ];

    pub fn key(self) -> &'static str {
        match self {
            PatternKind::Request => "req",
            PatternKind::Respond => "res",
            PatternKind::Send => "send",
            PatternKind::Receive => "recv",
            PatternKind::Publish => "pub",
            PatternKind::Subscribe => "sub",
        }
    }

    pub fn exchange_prefix(self) -> &'static str {
        match self {
            PatternKind::Request | PatternKind::Respond => REQ_RES_PREFIX,
            PatternKind::Send | PatternKind::Receive => SEND_RECV_PREFIX,
            PatternKind::Publish | PatternKind::Subscribe => PUB_SUB_PREFIX,
        }
    }

    pub fn exchange_type(self) -> ExchangeType {
        match self {
            PatternKind::Publish | PatternKind::Subscribe => ExchangeType::Fanout,
            _ => ExchangeType::Direct,
        }
    }

    /// Consuming sides own a queue bound to the exchange.
    pub fn consumes(self) -> bool {
        matches!(
            self,
            PatternKind::Respond | PatternKind::Receive | PatternKind::Subscribe
        )
    }

    pub fn expects_reply(self) -> bool {
        matches!(self, PatternKind::Request | PatternKind::Respond)
    }

    pub fn exchange_name(self, service: &str) -> String {
        format!("{}{}", self.exchange_prefix(), service)
    }

    /// Subscribers of the same service each need their own queue, so the
    /// config name is appended when there is one.
    pub fn queue_name(self, service: &str, config_name: Option<&str>) -> String {
        let exchange = self.exchange_name(service);
        match (self, config_name) {
            (PatternKind::Subscribe, Some(name)) => format!("{}.{}", exchange, name),
            _ => exchange,
        }
    }
}

/// One config key normalized into a uniform list of services.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternGroup {
    pub kind: PatternKind,
    pub services: Vec<ServiceOptions>,
}

impl SimplifiedConfig {
    fn entries(&self, kind: PatternKind) -> Option<&OneOrMany<crate::config::PatternEntry>> {
        match kind {
            PatternKind::Request => self.req.as_ref(),
            PatternKind::Respond => self.res.as_ref(),
            PatternKind::Send => self.send.as_ref(),
            PatternKind::Receive => self.recv.as_ref(),
            PatternKind::Publish => self.publish.as_ref(),
            PatternKind::Subscribe => self.subscribe.as_ref(),
        }
    }

    pub fn has_pattern(&self, kind: PatternKind) -> bool {
        self.entries(kind).is_some_and(|entries| !entries.is_empty())
    }

    pub fn pattern_groups(&self) -> Vec<PatternGroup> {
        PatternKind::ALL
            .iter()
            .filter_map(|&kind| {
                self.entries(kind).map(|entries| PatternGroup {
                    kind,
                    services: entries.iter().cloned().map(|e| e.into_options()).collect(),
                })
            })
            .collect()
    }
}

/// Expand a short-hand config.
pub fn transform_config(config: &SimplifiedConfig) -> Result<ExpandedConfig> {
    let mut connection = config
        .connection
        .clone()
        .ok_or_else(|| RabRpcError::Configuration("connection is required".to_string()))?
        .into_options();

    // Requesters and responders keep the client's reply queue default.
    if !config.has_pattern(PatternKind::Request) && !config.has_pattern(PatternKind::Respond) {
        connection.reply_queue = Some(false);
    }

    let name = config.name.clone().or_else(|| connection.name.clone());

    let mut expanded = ExpandedConfig {
        name,
        connection,
        exchanges: Vec::new(),
        queues: Vec::new(),
        bindings: Vec::new(),
    };

    for group in config.pattern_groups() {
        for service in group.services {
            if service.service_name.trim().is_empty() {
                return Err(RabRpcError::Configuration(format!(
                    "empty service name under '{}'",
                    group.kind.key()
                )));
            }

            let exchange_name = group.kind.exchange_name(&service.service_name);
            let reply_timeout = group
                .kind
                .expects_reply()
                .then(|| service.reply_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT_MS));

            expanded.add_exchange(Exchange {
                name: exchange_name.clone(),
                kind: group.kind.exchange_type(),
                reply_timeout,
                auto_delete: service.auto_delete,
                durable: service.durable,
            });

            if group.kind.consumes() {
                let queue_name = group
                    .kind
                    .queue_name(&service.service_name, expanded.name.as_deref());

                expanded.add_queue(Queue {
                    name: queue_name.clone(),
                    subscribe: true,
                    auto_delete: service.auto_delete,
                    durable: service.durable,
                    limit: service.limit,
                });
                expanded.add_binding(Binding {
                    exchange: exchange_name,
                    target: queue_name,
                    keys: OneOrMany::One(service.service_name),
                });
            }
        }
    }

    Ok(expanded)
}

/// Expand a config given as raw JSON; `null` or a non-object value counts as
/// a missing config.
pub fn transform_value(value: &Value) -> Result<ExpandedConfig> {
    if !value.is_object() {
        return Err(RabRpcError::Configuration(
            "config must be an object".to_string(),
        ));
    }
    let config: SimplifiedConfig = serde_json::from_value(value.clone())
        .map_err(|e| RabRpcError::Configuration(e.to_string()))?;
    transform_config(&config)
}
