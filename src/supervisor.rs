// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Channel Supervision
//!
//! Two perpetual loops keep one connection and one channel on it alive:
//!
//! ```text
//!   watch_connection: Absent ─dial─► Established ─closed─► (backoff) ─► Absent
//!   watch_channel:    no conn ─► (wait) ─► open ─► replay exchanges ─► Established
//!                                                   └─ first time only: ready
//! ```
//!
//! Failures never leave the loops; they are reported to the [`ErrorSink`].
//! Both loops stop at any suspension point once the token is cancelled.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection},
    configs::SupervisorConfigs,
    errors::AmqpError,
    exchange::ExchangeRegistry,
    link::Link,
    sink::ErrorSink,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State shared by the supervision loops.
#[derive(Clone)]
pub(crate) struct Watchers {
    pub(crate) connection: Link<dyn BrokerConnection>,
    pub(crate) channel: Link<dyn BrokerChannel>,
    pub(crate) exchanges: Arc<ExchangeRegistry>,
    pub(crate) errors: ErrorSink,
    pub(crate) delays: SupervisorConfigs,
    pub(crate) token: CancellationToken,
}

impl Watchers {
    /// Sleeps for `delay`; returns `false` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Keeps a connection to `url` established.
    ///
    /// `initial` is used as the first connection instead of dialing.
    pub(crate) async fn watch_connection(
        self,
        broker: Arc<dyn Broker>,
        url: String,
        initial: Option<Arc<dyn BrokerConnection>>,
    ) {
        info!("watching for connection");
        let mut next = initial;

        loop {
            let conn = match next.take() {
                Some(conn) => conn,
                None => {
                    info!("connecting to mq");
                    self.connection.establishing();

                    let dialed = tokio::select! {
                        _ = self.token.cancelled() => break,
                        dialed = broker.dial(&url) => dialed,
                    };

                    match dialed {
                        Ok(conn) => conn,
                        Err(err) => {
                            self.connection.clear();
                            self.errors.report(err);
                            if !self.pause(self.delays.dial_retry_delay()).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let closed = conn.closed();
            self.connection.establish(conn);
            info!("connected to mq");

            let reason = tokio::select! {
                _ = self.token.cancelled() => break,
                reason = closed => reason.unwrap_or_else(|_| {
                    AmqpError::ConnectionClosed("close notifier dropped".to_owned())
                }),
            };

            self.errors.report(reason);
            self.connection.clear();

            let delay = self.delays.connection_backoff();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            if !self.pause(delay).await {
                break;
            }
        }

        self.connection.clear();
        debug!("connection watcher stopped");
    }

    /// Keeps a channel open on whatever connection is established.
    ///
    /// Every new channel gets the registered exchanges re-declared; the first
    /// one also fires `ready`.
    pub(crate) async fn watch_channel(self, ready: oneshot::Sender<()>) {
        info!("watching for channel");
        let mut ready = Some(ready);

        loop {
            let Some(conn) = self.connection.current() else {
                let delay = self.delays.channel_backoff();
                info!(delay_ms = delay.as_millis() as u64, "not connected to mq, waiting");
                if !self.pause(delay).await {
                    break;
                }
                continue;
            };

            self.channel.establishing();
            let opened = tokio::select! {
                _ = self.token.cancelled() => break,
                opened = conn.open_channel() => opened,
            };

            let channel = match opened {
                Ok(channel) => channel,
                Err(err) => {
                    self.channel.clear();
                    self.errors.report(err);
                    if !self.pause(self.delays.channel_retry_delay()).await {
                        break;
                    }
                    continue;
                }
            };

            let closed = channel.closed();
            self.exchanges.replay(channel.as_ref(), &self.errors).await;
            self.channel.establish(channel);

            if let Some(ready) = ready.take() {
                debug!("first channel is up, signaling readiness");
                let _ = ready.send(());
            }
            info!("channel opened");

            let reason = tokio::select! {
                _ = self.token.cancelled() => break,
                reason = closed => reason.unwrap_or_else(|_| {
                    AmqpError::ChannelClosedByBroker("close notifier dropped".to_owned())
                }),
                _ = self.connection.lost(&conn) => {
                    AmqpError::ChannelClosedByBroker("connection lost".to_owned())
                }
            };

            self.errors.report(reason);
            self.channel.clear();

            let delay = self.delays.channel_backoff();
            info!(delay_ms = delay.as_millis() as u64, "reopening channel");
            if !self.pause(delay).await {
                break;
            }
        }

        self.channel.clear();
        debug!("channel watcher stopped");
    }
}
