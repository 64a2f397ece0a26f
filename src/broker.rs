// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability
//!
//! The set of broker operations the supervisors, the publish facade and the
//! dispatcher rely on. [`crate::channel`] implements it over `lapin`; tests
//! implement it in memory.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::oneshot;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Entry point of the broker: dials connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One established broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once, with the reason, when the connection goes away.
    fn closed(&self) -> oneshot::Receiver<AmqpError>;
}

/// One open channel on a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Resolves once, with the reason, when the channel goes away.
    fn closed(&self) -> oneshot::Receiver<AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns the name the broker assigned to it.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), AmqpError>;
}

/// Settles a single delivery with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed over by the broker, pending acknowledgement.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub headers: HashMap<String, String>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(exchange: &str, body: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Delivery {
            exchange: exchange.to_owned(),
            routing_key: String::new(),
            body,
            redelivered: false,
            headers: HashMap::default(),
            acker,
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(false).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(false, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// A message on its way to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content_type: String,
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}
