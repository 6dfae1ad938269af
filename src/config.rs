// src/config.rs
use anyhow::{anyhow, Context};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{RabRpcError, Result};

/// Either a single value or a list of values.
///
/// Pattern keys accept both forms and normalize them identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value).iter(),
            OneOrMany::Many(values) => values.iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, OneOrMany::Many(values) if values.is_empty())
    }

    fn push(self, value: T) -> Self {
        let mut values = self.into_vec();
        values.push(value);
        OneOrMany::Many(values)
    }
}

/// Connection settings handed to the broker.
///
/// Unknown keys are kept in `extra` so an object connection passes through
/// the transformation unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,
    /// Heartbeat interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u16>,
    /// Per-attempt connect timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Connection attempts before the broker is considered unreachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_queue: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionOptions {
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    /// Resolve the AMQP URI, either parsed from `uri` or assembled from the
    /// individual parts.
    pub fn amqp_uri(&self) -> Result<AMQPUri> {
        let mut uri = match &self.uri {
            // amq-protocol reports parse failures as a bare String
            Some(raw) => raw.parse::<AMQPUri>().map_err(RabRpcError::from)?,
            None => {
                let defaults = AMQPUri::default();
                AMQPUri {
                    authority: AMQPAuthority {
                        userinfo: AMQPUserInfo {
                            username: self
                                .user
                                .clone()
                                .unwrap_or_else(|| defaults.authority.userinfo.username.clone()),
                            password: self
                                .pass
                                .clone()
                                .unwrap_or_else(|| defaults.authority.userinfo.password.clone()),
                        },
                        host: self
                            .host
                            .clone()
                            .unwrap_or_else(|| defaults.authority.host.clone()),
                        port: self.port.unwrap_or(defaults.authority.port),
                    },
                    vhost: self.vhost.clone().unwrap_or_else(|| defaults.vhost.clone()),
                    ..defaults
                }
            }
        };

        if let Some(heartbeat) = self.heartbeat {
            uri.query.heartbeat = Some(heartbeat);
        }

        Ok(uri)
    }
}

/// `connection` accepts a URI string or a full options object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConnectionConfig {
    Uri(String),
    Options(ConnectionOptions),
}

// Hand-written so a bad field reports what was wrong with `connection`
// rather than serde's untagged "did not match any variant".
impl<'de> Deserialize<'de> for ConnectionConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        match Value::deserialize(deserializer)? {
            Value::String(uri) => Ok(ConnectionConfig::Uri(uri)),
            value @ Value::Object(_) => serde_json::from_value(value)
                .map(ConnectionConfig::Options)
                .map_err(|e| D::Error::custom(format!("invalid connection: {}", e))),
            other => Err(D::Error::custom(format!(
                "connection must be a URI string or an object, got {}",
                other
            ))),
        }
    }
}

impl ConnectionConfig {
    pub fn into_options(self) -> ConnectionOptions {
        match self {
            ConnectionConfig::Uri(uri) => ConnectionOptions::from_uri(uri),
            ConnectionConfig::Options(options) => options,
        }
    }
}

impl From<&str> for ConnectionConfig {
    fn from(uri: &str) -> Self {
        ConnectionConfig::Uri(uri.to_string())
    }
}

impl From<ConnectionOptions> for ConnectionConfig {
    fn from(options: ConnectionOptions) -> Self {
        ConnectionConfig::Options(options)
    }
}

/// Per-service overrides for a pattern entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOptions {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u16>,
}

impl ServiceOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternEntry {
    Service(String),
    Detailed(ServiceOptions),
}

impl PatternEntry {
    pub fn into_options(self) -> ServiceOptions {
        match self {
            PatternEntry::Service(name) => ServiceOptions::new(name),
            PatternEntry::Detailed(options) => options,
        }
    }
}

impl From<&str> for PatternEntry {
    fn from(service: &str) -> Self {
        PatternEntry::Service(service.to_string())
    }
}

impl From<String> for PatternEntry {
    fn from(service: String) -> Self {
        PatternEntry::Service(service)
    }
}

impl From<ServiceOptions> for PatternEntry {
    fn from(options: ServiceOptions) -> Self {
        PatternEntry::Detailed(options)
    }
}

/// The short-hand configuration applications write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<OneOrMany<PatternEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<OneOrMany<PatternEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<OneOrMany<PatternEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv: Option<OneOrMany<PatternEntry>>,
    #[serde(rename = "pub", default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<OneOrMany<PatternEntry>>,
    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<OneOrMany<PatternEntry>>,
}

fn append(slot: &mut Option<OneOrMany<PatternEntry>>, entry: PatternEntry) {
    *slot = Some(match slot.take() {
        Some(existing) => existing.push(entry),
        None => OneOrMany::One(entry),
    });
}

impl SimplifiedConfig {
    pub fn new(connection: impl Into<ConnectionConfig>) -> Self {
        Self {
            connection: Some(connection.into()),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn req(mut self, entry: impl Into<PatternEntry>) -> Self {
        append(&mut self.req, entry.into());
        self
    }

    pub fn res(mut self, entry: impl Into<PatternEntry>) -> Self {
        append(&mut self.res, entry.into());
        self
    }

    pub fn send(mut self, entry: impl Into<PatternEntry>) -> Self {
        append(&mut self.send, entry.into());
        self
    }

    pub fn recv(mut self, entry: impl Into<PatternEntry>) -> Self {
        append(&mut self.recv, entry.into());
        self
    }

    pub fn publish(mut self, entry: impl Into<PatternEntry>) -> Self {
        append(&mut self.publish, entry.into());
        self
    }

    pub fn subscribe(mut self, entry: impl Into<PatternEntry>) -> Self {
        append(&mut self.subscribe, entry.into());
        self
    }
}

// Configuration file discovery and loading

pub const CONFIG_ENV_VAR: &str = "RABRPC_CONFIG";

pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(explicit);
        if path.exists() {
            debug!("Using config file from {}: {}", CONFIG_ENV_VAR, path.display());
            return Ok(path);
        }
        return Err(anyhow!(
            "{} points to {} which does not exist",
            CONFIG_ENV_VAR,
            path.display()
        ));
    }

    let locations = [
        ("Current directory", Path::new("rabrpc.json")),
        ("Current directory (alternative)", Path::new("config/rabrpc.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabrpc.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find rabrpc.json configuration file.
        Please create one in the current directory, config/, or your home directory
        (as .rabrpc.json), or set {}.",
        CONFIG_ENV_VAR
    ))
}

pub fn load_config(path: &Path) -> anyhow::Result<SimplifiedConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: SimplifiedConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or unexpected field types")?;

    if config.connection.is_none() {
        return Err(anyhow!(
            "Configuration error: {} has no connection",
            path.display()
        ));
    }

    Ok(config)
}
