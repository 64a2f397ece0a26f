// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # MQ Client
//!
//! [`MqClient`] owns one supervised connection and channel. It registers
//! exchanges, publishes to them and hands its channel to the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) on the consuming side.
//!
//! Publishing is fire-and-maybe-fail: nothing is queued or retried while the
//! channel is down.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, OutgoingMessage},
    configs::Configs,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeRegistry},
    link::{Link, LinkState},
    otel,
    sink::{self, ErrorSink},
    supervisor::Watchers,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// What the client is allowed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientMode {
    /// Declares exchanges and publishes to them.
    #[default]
    Publisher,
    /// Only consumes; [`MqClient::send`] is rejected.
    Consumer,
}

/// Supervised client for one broker.
pub struct MqClient {
    mode: ClientMode,
    connection: Link<dyn BrokerConnection>,
    channel: Link<dyn BrokerChannel>,
    exchanges: Arc<ExchangeRegistry>,
    errors: ErrorSink,
    ready: Mutex<Option<oneshot::Receiver<()>>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MqClient {
    /// Dials the broker once and starts the supervision loops.
    ///
    /// The first dial must succeed; every later disconnect is recovered by the
    /// connection supervisor.
    ///
    /// # Parameters
    /// * `broker` - Capability used for this dial and every redial
    /// * `cfg` - Broker address and supervision delays
    /// * `mode` - Whether the client may publish
    ///
    /// # Returns
    /// A client whose channel may not be open yet; see [`MqClient::ready`]
    pub async fn connect(
        broker: Arc<dyn Broker>,
        cfg: &Configs,
        mode: ClientMode,
    ) -> Result<MqClient, AmqpError> {
        let url = cfg.amqp_uri();
        debug!("creating amqp connection...");
        let conn = broker.dial(&url).await.map_err(|err| {
            error!(error = %err, "unable to connect to amqp");
            err
        })?;
        debug!("amqp connected");

        let token = CancellationToken::new();
        let (errors, errors_rx) = ErrorSink::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let watchers = Watchers {
            connection: Link::new(),
            channel: Link::new(),
            exchanges: Arc::new(ExchangeRegistry::new()),
            errors: errors.clone(),
            delays: cfg.supervisor.clone(),
            token: token.clone(),
        };

        let client = MqClient {
            mode,
            connection: watchers.connection.clone(),
            channel: watchers.channel.clone(),
            exchanges: watchers.exchanges.clone(),
            errors,
            ready: Mutex::new(Some(ready_rx)),
            token: token.clone(),
            tasks: Mutex::new(vec![]),
        };

        let tasks = vec![
            tokio::spawn(sink::watch_errors(errors_rx, token)),
            tokio::spawn(
                watchers
                    .clone()
                    .watch_connection(broker, url, Some(conn)),
            ),
            tokio::spawn(watchers.watch_channel(ready_tx)),
        ];
        *client.tasks.lock().await = tasks;

        Ok(client)
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn connection_state(&self) -> LinkState {
        self.connection.state()
    }

    pub fn channel_state(&self) -> LinkState {
        self.channel.state()
    }

    /// Waits until the channel reaches `state`.
    pub async fn channel_reached(&self, state: LinkState) {
        self.channel.reached(state).await
    }

    /// The currently open channel, if any.
    pub fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.current()
    }

    /// Sink the supervision loops report to.
    pub fn errors(&self) -> ErrorSink {
        self.errors.clone()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for the first channel to be opened.
    ///
    /// Only the first call observes the signal. Later calls wait until
    /// [`MqClient::shutdown`].
    pub async fn ready(&self) {
        let rx = self.ready.lock().await.take();
        match rx {
            Some(rx) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = rx => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Declares `name` on the current channel and remembers it for replay.
    ///
    /// A name that is already registered is left untouched.
    ///
    /// # Errors
    /// * `NotConnected` - no connection is established
    /// * `ChannelClosed` - the connection has no open channel
    /// * `DeclareExchangeError` - the broker refused the declaration
    pub async fn connect_to_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        if self.connection.state() != LinkState::Established {
            return Err(AmqpError::NotConnected);
        }

        let channel = self.channel.current().ok_or(AmqpError::ChannelClosed)?;
        self.exchanges.declare(channel.as_ref(), name, kind).await?;

        info!(exchange = name, "exchange ready");
        Ok(())
    }

    /// Publishes `payload` to a registered exchange.
    ///
    /// Nothing is queued or retried: while the channel is down the call fails.
    ///
    /// # Parameters
    /// * `exchange` - A name previously passed to [`MqClient::connect_to_exchange`]
    /// * `payload` - Message body, sent as `application/json`
    /// * `routing_key` - Routing key, ignored by fanout exchanges
    ///
    /// # Errors
    /// `NotForSending`, `ExchangeNotCreated` and `ChannelClosed` are returned
    /// before reaching the broker; `PublishingError` comes from the broker.
    pub async fn send(
        &self,
        exchange: &str,
        payload: &[u8],
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        if self.mode == ClientMode::Consumer {
            return Err(AmqpError::NotForSending);
        }

        if !self.exchanges.contains(exchange).await {
            return Err(AmqpError::ExchangeNotCreated(exchange.to_owned()));
        }

        let channel = self.channel.current().ok_or(AmqpError::ChannelClosed)?;

        let mut headers = HashMap::default();
        otel::inject(&opentelemetry::Context::current(), &mut headers);

        let message = OutgoingMessage {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            headers,
            body: payload.to_vec(),
        };

        channel
            .publish(exchange, routing_key, message)
            .await
            .map_err(|err| {
                error!(error = %err, exchange, "error publishing message");
                err
            })
    }

    /// Serializes `event` as JSON and publishes it.
    pub async fn send_json<T: Serialize>(
        &self,
        exchange: &str,
        event: &T,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let payload = serde_json::to_vec(event)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        self.send(exchange, &payload, routing_key).await
    }

    /// Stops the supervision loops and waits for them to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "supervision task failed");
            }
        }
    }
}

impl Drop for MqClient {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
