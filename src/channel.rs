// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel
//!
//! The broker capability implemented over `lapin`. Connections and channels
//! report their closure through `on_error`, which is turned into the one-shot
//! notification the supervisors wait on.

use crate::{
    broker::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream,
        OutgoingMessage,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone)]
pub struct LapinBroker {
    connection_name: String,
}

impl LapinBroker {
    /// `connection_name` is shown in the broker's management UI.
    pub fn new(connection_name: &str) -> Arc<LapinBroker> {
        Arc::new(LapinBroker {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(url, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// Wraps a one-shot sender so it can live in a `FnMut` error callback.
fn close_notifier<F>(
    wrap: F,
) -> (
    impl FnMut(lapin::Error) + Send + 'static,
    oneshot::Receiver<AmqpError>,
)
where
    F: Fn(String) -> AmqpError + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let notify = move |err: lapin::Error| {
        let pending = tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = pending {
            let _ = tx.send(wrap(err.to_string()));
        }
    };
    (notify, rx)
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn closed(&self) -> oneshot::Receiver<AmqpError> {
        let (notify, rx) = close_notifier(AmqpError::ConnectionClosed);
        self.conn.on_error(notify);
        rx
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn closed(&self) -> oneshot::Receiver<AmqpError> {
        let (notify, rx) = close_notifier(AmqpError::ChannelClosedByBroker);
        self.channel.on_error(notify);
        rx
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => {
                debug!("queue: {} was created", def.name);
                Ok(queue.name().as_str().to_owned())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let headers: BTreeMap<ShortString, AMQPValue> = message
            .headers
            .into_iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                )
            })
            .collect();

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(message.content_type))
                    .with_message_id(ShortString::from(message.message_id))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Keeps the lapin delivery around to settle it later.
struct LapinAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.delivery
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.delivery
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

fn into_delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let body = std::mem::take(&mut delivery.data);
    let exchange = delivery.exchange.to_string();
    let routing_key = delivery.routing_key.to_string();
    let redelivered = delivery.redelivered;
    let headers = string_headers(delivery.properties.headers());

    Delivery::new(&exchange, body, Arc::new(LapinAcker { delivery }))
        .routing_key(&routing_key)
        .redelivered(redelivered)
        .headers(headers)
}

/// Keeps the string-valued headers, which is where trace context travels.
fn string_headers(headers: &Option<FieldTable>) -> HashMap<String, String> {
    let Some(headers) = headers else {
        return HashMap::default();
    };

    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => Some((
                key.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(value) => Some((key.to_string(), value.to_string())),
            _ => None,
        })
        .collect()
}
