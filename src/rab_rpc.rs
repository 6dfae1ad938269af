//! The facade applications hold on to.
//!
//! `RabRpc` owns a broker handle and an initialized flag; everything else is
//! forwarded to the pattern functions in [`crate::patterns`].

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::broker::Broker;
use crate::config::SimplifiedConfig;
use crate::errors::{RabRpcError, Result};
use crate::handler::Actions;
use crate::patterns::{pub_sub, req_res, send_recv, CallOptions};
use crate::rabbitmq::RabbitBroker;
use crate::registry::Subscription;
use crate::transform::{transform_config, transform_value, ExpandedConfig};

pub struct RabRpc {
    broker: Arc<dyn Broker>,
    initialized: AtomicBool,
}

impl RabRpc {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            initialized: AtomicBool::new(false),
        }
    }

    /// Facade over a real RabbitMQ server.
    pub fn rabbitmq() -> Self {
        Self::new(Arc::new(RabbitBroker::new()))
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn configure(&self, config: &SimplifiedConfig) -> Result<()> {
        match transform_config(config) {
            Ok(expanded) => self.configure_expanded(expanded).await,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Hand an already expanded config to the broker.
    pub async fn configure_expanded(&self, config: ExpandedConfig) -> Result<()> {
        let name = config.name.clone();
        match self.broker.configure(config).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                info!(connection = ?name, "Configured");
                Ok(())
            }
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                error!(connection = ?name, error = %e, "Configuration failed");
                Err(e)
            }
        }
    }

    /// Configure from raw JSON. With `transform` unset the value must already
    /// be in the expanded shape.
    pub async fn configure_value(&self, value: &Value, transform: bool) -> Result<()> {
        let expanded = if transform {
            transform_value(value)
        } else {
            serde_json::from_value::<ExpandedConfig>(value.clone())
                .map_err(|e| RabRpcError::Configuration(e.to_string()))
        };

        match expanded {
            Ok(expanded) => self.configure_expanded(expanded).await,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub async fn close_all(&self, reset: bool) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        self.broker.close_all(reset).await?;
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        self.broker.shutdown().await?;
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop_subscription(&self, queue: &str, connection: Option<&str>) -> Result<()> {
        self.broker.stop_subscription(queue, connection).await
    }

    pub async fn request<P, R>(&self, topic: &str, payload: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request_with(topic, payload, &CallOptions::default()).await
    }

    pub async fn request_with<P, R>(
        &self,
        topic: &str,
        payload: &P,
        options: &CallOptions,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        req_res::request(self.broker.as_ref(), topic, payload, options).await
    }

    pub fn respond<P, R, F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        req_res::respond(self.broker.as_ref(), topic, handler)
    }

    pub async fn send<P>(&self, topic: &str, payload: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        self.send_with(topic, payload, &CallOptions::default()).await
    }

    pub async fn send_with<P>(&self, topic: &str, payload: &P, options: &CallOptions) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        send_recv::send(self.broker.as_ref(), topic, payload, options).await
    }

    pub fn receive<P, F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        send_recv::receive(self.broker.as_ref(), topic, handler)
    }

    pub async fn publish<P>(&self, topic: &str, payload: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        self.publish_with(topic, payload, &CallOptions::default()).await
    }

    pub async fn publish_with<P>(
        &self,
        topic: &str,
        payload: &P,
        options: &CallOptions,
    ) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        pub_sub::publish(self.broker.as_ref(), topic, payload, options).await
    }

    pub fn subscribe<P, F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Actions, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        pub_sub::subscribe(self.broker.as_ref(), topic, handler)
    }
}
