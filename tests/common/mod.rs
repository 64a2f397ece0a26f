// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory fanout broker used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use mqplay::{
    broker::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream,
        OutgoingMessage,
    },
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack { exchange: String, redelivered: bool },
    Nack { exchange: String, requeue: bool },
}

#[derive(Default)]
struct State {
    dials: usize,
    failing_dials: usize,
    channels_opened: usize,
    failing_opens: usize,
    connection_closers: Vec<oneshot::Sender<AmqpError>>,
    channel_closers: Vec<(Arc<AtomicBool>, oneshot::Sender<AmqpError>)>,
    declared: Vec<String>,
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    published: Vec<(String, OutgoingMessage)>,
    settlements: Vec<Settlement>,
}

/// Fanout broker shared by every connection dialed from it.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Makes the next `n` dials fail.
    pub fn fail_dials(&self, n: usize) {
        self.state().failing_dials = n;
    }

    /// Makes the next `n` channel opens fail.
    pub fn fail_channel_opens(&self, n: usize) {
        self.state().failing_opens = n;
    }

    /// Closes every live connection and channel, as a broker restart would.
    pub fn restart(&self) {
        let mut state = self.state();
        for tx in state.connection_closers.drain(..) {
            let _ = tx.send(AmqpError::ConnectionClosed("broker restart".to_owned()));
        }
        for (open, tx) in state.channel_closers.drain(..) {
            open.store(false, Ordering::SeqCst);
            let _ = tx.send(AmqpError::ChannelClosedByBroker("broker restart".to_owned()));
        }
    }

    pub fn dials(&self) -> usize {
        self.state().dials
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    /// How many times `exchange` was declared.
    pub fn declarations(&self, exchange: &str) -> usize {
        self.state()
            .declared
            .iter()
            .filter(|name| name.as_str() == exchange)
            .count()
    }

    pub fn published(&self) -> Vec<(String, OutgoingMessage)> {
        self.state().published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    fn deliver(&self, queue: &str, exchange: &str, body: Vec<u8>, redelivered: bool) {
        let state = self.state();
        if let Some(tx) = state.queues.get(queue) {
            let acker = FakeAcker {
                broker: self.clone(),
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                body: body.clone(),
                redelivered,
            };
            let delivery = Delivery::new(exchange, body, Arc::new(acker)).redelivered(redelivered);
            let _ = tx.send(delivery);
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        state.dials += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(Arc::new(FakeConnection {
            broker: self.clone(),
        }))
    }
}

struct FakeConnection {
    broker: FakeBroker,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.state();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
        }
        state.channels_opened += 1;

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }

    fn closed(&self) -> oneshot::Receiver<AmqpError> {
        let (tx, rx) = oneshot::channel();
        self.broker.state().connection_closers.push(tx);
        rx
    }
}

struct FakeChannel {
    broker: FakeBroker,
    open: Arc<AtomicBool>,
}

impl FakeChannel {
    fn check_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn closed(&self) -> oneshot::Receiver<AmqpError> {
        let (tx, rx) = oneshot::channel();
        self.broker
            .state()
            .channel_closers
            .push((self.open.clone(), tx));
        rx
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.state().declared.push(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.check_open()?;
        Ok(def.name().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker
            .state()
            .bindings
            .entry(binding.exchange_name().to_owned())
            .or_default()
            .push(binding.queue_name().to_owned());
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state().queues.insert(queue.to_owned(), tx);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let queues = {
            let mut state = self.broker.state();
            state.published.push((exchange.to_owned(), message.clone()));
            state.bindings.get(exchange).cloned().unwrap_or_default()
        };

        for queue in queues {
            self.broker
                .deliver(&queue, exchange, message.body.clone(), false);
        }
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    queue: String,
    exchange: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self, _multiple: bool) -> Result<(), AmqpError> {
        self.broker.state().settlements.push(Settlement::Ack {
            exchange: self.exchange.clone(),
            redelivered: self.redelivered,
        });
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.broker.state().settlements.push(Settlement::Nack {
            exchange: self.exchange.clone(),
            requeue,
        });
        if requeue {
            self.broker
                .deliver(&self.queue, &self.exchange, self.body.clone(), true);
        }
        Ok(())
    }
}

/// Configs with millisecond supervision delays.
pub fn fast_configs() -> Configs {
    let mut cfg = Configs::default();
    cfg.supervisor.connection_backoff_ms = 5;
    cfg.supervisor.dial_retry_delay_ms = 5;
    cfg.supervisor.channel_backoff_ms = 5;
    cfg.supervisor.channel_retry_delay_ms = 5;
    cfg
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
