// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! Consumes one per-process queue per registered handler and routes every
//! delivery to the handler registered for `<exchange>:<kind>`.
//!
//! ```text
//!   queue A ─► forwarder ─┐
//!   queue B ─► forwarder ─┼─► delivery bus ─► serve loop ─► handler ─► ack / nack
//!   queue C ─► forwarder ─┘
//! ```
//!
//! Disposition policy:
//! - handler succeeded: ack
//! - handler failed, first delivery: nack and requeue
//! - handler failed, already redelivered: ack, dropping the message
//!
//! A delivery whose key has no handler counts as a handler failure.

use crate::{
    broker::{BrokerChannel, Delivery},
    client::MqClient,
    configs::DispatcherConfigs,
    errors::AmqpError,
    exchange::{Exchange, ExchangeDefinition, ExchangeKind},
    otel,
    queue::{QueueBinding, QueueDefinition},
    sink::ErrorSink,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Builds the registry key for an exchange.
pub fn handler_key(exchange: &str, kind: &ExchangeKind) -> String {
    format!("{}:{}", exchange, kind)
}

/// Per-delivery metadata handed to handlers.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub correlation_id: Uuid,
    pub exchange: String,
    pub kind: ExchangeKind,
    /// Trace context extracted from the delivery headers.
    pub otel: opentelemetry::Context,
}

/// Handles the deliveries of one `<exchange>:<kind>` key.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, ctx: &DeliveryContext, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Handlers keyed by `<exchange>:<kind>`.
///
/// Built once at startup and handed to the [`Dispatcher`], which never mutates it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, (Exchange, Arc<dyn DeliveryHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for the deliveries of one exchange.
    ///
    /// A previous handler for the same `<exchange>:<kind>` key is replaced.
    /// One exchange name must always be registered with the same kind;
    /// [`Dispatcher::run`] rejects a registry that mixes kinds.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange to consume from
    /// * `kind` - Kind the exchange is declared with
    /// * `handler` - Handler invoked for every delivery of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(
        mut self,
        exchange: &str,
        kind: ExchangeKind,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let key = handler_key(exchange, &kind);
        let exchange = Exchange {
            name: exchange.to_owned(),
            kind,
        };
        self.handlers.insert(key, (exchange, handler));
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DeliveryHandler>> {
        self.handlers.get(key).map(|(_, handler)| handler.clone())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Exchanges the handlers listen on.
    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.handlers.values().map(|(exchange, _)| exchange)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Checks that no exchange name is registered under two kinds.
    ///
    /// Queues are named after the exchange alone, so two kinds would declare
    /// the same exchange twice and share one queue.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let mut kinds: HashMap<&str, &ExchangeKind> = HashMap::default();
        for exchange in self.exchanges() {
            match kinds.insert(exchange.name.as_str(), &exchange.kind) {
                Some(previous) if previous != &exchange.kind => {
                    return Err(AmqpError::ConflictingExchangeKind(exchange.name.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Terminal outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack with requeue, giving the message one more chance.
    Requeue,
    /// Ack a message that already failed once.
    Drop,
}

impl Disposition {
    pub fn of(result: &Result<(), AmqpError>, redelivered: bool) -> Disposition {
        match (result, redelivered) {
            (Ok(()), _) => Disposition::Ack,
            (Err(_), false) => Disposition::Requeue,
            (Err(_), true) => Disposition::Drop,
        }
    }
}

struct Inbound {
    kind: ExchangeKind,
    delivery: Delivery,
}

/// Consumes every registered exchange and dispatches to its handler.
pub struct Dispatcher {
    channel: Arc<dyn BrokerChannel>,
    handlers: Arc<HandlerRegistry>,
    errors: ErrorSink,
    cfg: DispatcherConfigs,
    token: CancellationToken,
    started_at: i64,
}

impl Dispatcher {
    /// Creates a dispatcher over an already opened channel.
    ///
    /// # Parameters
    /// * `channel` - Channel the queues are declared and consumed on
    /// * `handlers` - Handlers keyed by `<exchange>:<kind>`
    /// * `errors` - Sink for settlement and consume failures
    /// * `cfg` - Bus capacity and binding key
    /// * `token` - Stops the forwarders and the serve loop once cancelled
    ///
    /// # Returns
    /// A dispatcher whose queue names carry the current unix timestamp
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        handlers: HandlerRegistry,
        errors: ErrorSink,
        cfg: DispatcherConfigs,
        token: CancellationToken,
    ) -> Self {
        Dispatcher {
            channel,
            handlers: Arc::new(handlers),
            errors,
            cfg,
            token,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Builds a dispatcher on the client's current channel.
    ///
    /// The dispatcher reports to the client's error sink and stops when the
    /// client shuts down. It keeps consuming on this channel only.
    ///
    /// # Errors
    /// `ChannelClosed` when the client has no open channel
    pub fn from_client(
        client: &MqClient,
        handlers: HandlerRegistry,
        cfg: DispatcherConfigs,
    ) -> Result<Self, AmqpError> {
        let channel = client.current_channel().ok_or(AmqpError::ChannelClosed)?;
        Ok(Self::new(
            channel,
            handlers,
            client.errors(),
            cfg,
            client.token().child_token(),
        ))
    }

    /// Name of the per-process queue for `exchange`.
    pub fn queue_name(&self, exchange: &str) -> String {
        format!("{}-{}", exchange, self.started_at)
    }

    /// Declares and starts consuming every queue, then spawns the serve loop.
    ///
    /// Setup failures are returned before anything is served. Once running, the
    /// loop stops when the token is cancelled or every consumer has ended.
    ///
    /// # Returns
    /// The handle of the serve loop task
    pub async fn run(self) -> Result<JoinHandle<()>, AmqpError> {
        self.handlers.validate()?;

        let (tx, rx) = mpsc::channel(self.cfg.bus_capacity.max(1));
        self.init_exchanges(&tx).await?;
        drop(tx);

        Ok(tokio::spawn(self.serve(rx)))
    }

    async fn init_exchanges(&self, bus: &mpsc::Sender<Inbound>) -> Result<(), AmqpError> {
        info!("preparing exchanges");

        for exchange in self.handlers.exchanges() {
            let queue = self.queue_name(&exchange.name);
            debug!(
                exchange = %exchange.name,
                kind = %exchange.kind,
                queue = %queue,
                "declaring exchange"
            );

            self.channel
                .declare_exchange(
                    &ExchangeDefinition::new(&exchange.name).kind(exchange.kind.clone()),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = %err,
                        exchange = %exchange.name,
                        "error to declare the exchange"
                    );
                    AmqpError::DeclareExchangeError(exchange.name.clone())
                })?;

            let queue = self
                .channel
                .declare_queue(&QueueDefinition::new(&queue).delete())
                .await
                .map_err(|err| {
                    error!(error = %err, queue = %queue, "error to declare the queue");
                    AmqpError::DeclareQueueError(queue.clone())
                })?;

            self.channel
                .bind_queue(
                    &QueueBinding::new(&queue)
                        .exchange(&exchange.name)
                        .routing_key(&self.cfg.binding_key),
                )
                .await
                .map_err(|err| {
                    error!(error = %err, queue = %queue, "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(exchange.name.clone(), queue.clone())
                })?;

            let consumer_tag = format!("{}-consumer", queue);
            let stream = self
                .channel
                .consume(&queue, &consumer_tag)
                .await
                .map_err(|err| {
                    error!(error = %err, queue = %queue, "error to create the consumer");
                    AmqpError::BindingConsumerError(queue.clone())
                })?;

            tokio::spawn(forward(
                stream,
                queue.clone(),
                exchange.kind.clone(),
                bus.clone(),
                self.errors.clone(),
                self.token.clone(),
            ));

            info!(exchange = %exchange.name, queue = %queue, "ready");
        }

        Ok(())
    }

    async fn serve(self, mut bus: mpsc::Receiver<Inbound>) {
        info!("running loop");

        loop {
            let inbound = tokio::select! {
                _ = self.token.cancelled() => break,
                inbound = bus.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            self.dispatch(inbound.kind, inbound.delivery).await;
        }

        debug!("dispatcher stopped");
    }

    /// Runs the handler for `delivery` and settles it with the broker.
    pub async fn dispatch(&self, kind: ExchangeKind, delivery: Delivery) -> Disposition {
        let correlation_id = Uuid::new_v4();
        let span = info_span!(
            "delivery",
            id = %correlation_id,
            exchange = %delivery.exchange,
            kind = %kind
        );

        async move {
            debug!("accepted");

            let key = handler_key(&delivery.exchange, &kind);
            let (otel_ctx, mut otel_span) =
                otel::new_span(&delivery.headers, &global::tracer("amqp consumer"), &key);

            let ctx = DeliveryContext {
                correlation_id,
                exchange: delivery.exchange.clone(),
                kind,
                otel: otel_ctx,
            };

            let result = match self.handlers.get(&key) {
                Some(handler) => handler.handle(&ctx, &delivery).await,
                None => Err(AmqpError::HandlerNotFound(key)),
            };

            let disposition = Disposition::of(&result, delivery.redelivered);
            match &result {
                Ok(()) => {
                    debug!("served");
                    otel_span.set_status(Status::Ok);
                }
                Err(err) => {
                    error!(
                        error = %err,
                        redelivered = delivery.redelivered,
                        "unable to handle operation"
                    );
                    otel_span.record_error(err);
                    otel_span.set_status(Status::Error {
                        description: Cow::from(err.to_string()),
                    });
                }
            }

            let settled = match disposition {
                Disposition::Ack | Disposition::Drop => delivery.ack().await,
                Disposition::Requeue => delivery.nack(true).await,
            };
            if let Err(err) = settled {
                otel_span.record_error(&err);
                self.errors.report(err);
            }

            disposition
        }
        .instrument(span)
        .await
    }
}

/// Pushes every delivery of one consumer onto the shared bus, in order.
///
/// A stream that ends while the token is still live means the broker stopped
/// the consumer; that is reported since nothing resumes it.
async fn forward(
    mut stream: crate::broker::DeliveryStream,
    queue: String,
    kind: ExchangeKind,
    bus: mpsc::Sender<Inbound>,
    errors: ErrorSink,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                debug!(exchange = %delivery.exchange, "incoming delivery");
                let inbound = Inbound {
                    kind: kind.clone(),
                    delivery,
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = bus.send(inbound) => if sent.is_err() { break },
                }
            }
            Some(Err(err)) => errors.report(err),
            None => {
                if !token.is_cancelled() {
                    errors.report(AmqpError::ConsumerError(format!(
                        "consumer of `{}` ended",
                        queue
                    )));
                }
                break;
            }
        }
    }

    debug!(queue = %queue, kind = %kind, "forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acknowledger, MockAcknowledger, MockBrokerChannel};
    use mockall::predicate::eq;
    use std::time::Duration;

    struct Outcome(Result<(), AmqpError>);

    #[async_trait]
    impl DeliveryHandler for Outcome {
        async fn handle(&self, _: &DeliveryContext, _: &Delivery) -> Result<(), AmqpError> {
            self.0.clone()
        }
    }

    /// Records every settlement as `(acked, requeue)`.
    struct RecordingAcker(mpsc::UnboundedSender<(bool, bool)>);

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self, _multiple: bool) -> Result<(), AmqpError> {
            let _ = self.0.send((true, false));
            Ok(())
        }

        async fn nack(&self, _multiple: bool, requeue: bool) -> Result<(), AmqpError> {
            let _ = self.0.send((false, requeue));
            Ok(())
        }
    }

    fn dispatcher(handlers: HandlerRegistry, errors: ErrorSink) -> Dispatcher {
        Dispatcher::new(
            Arc::new(MockBrokerChannel::new()),
            handlers,
            errors,
            DispatcherConfigs::default(),
            CancellationToken::new(),
        )
    }

    fn alarm_handler(result: Result<(), AmqpError>) -> HandlerRegistry {
        HandlerRegistry::new().register("alarm", ExchangeKind::Fanout, Arc::new(Outcome(result)))
    }

    fn acking_once() -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().with(eq(false)).times(1).returning(|_| Ok(()));
        acker.expect_nack().never();
        acker
    }

    #[test]
    fn disposition_policy() {
        let failed = Err(AmqpError::HandlerError("nope".to_owned()));

        assert_eq!(Disposition::of(&Ok(()), false), Disposition::Ack);
        assert_eq!(Disposition::of(&Ok(()), true), Disposition::Ack);
        assert_eq!(Disposition::of(&failed, false), Disposition::Requeue);
        assert_eq!(Disposition::of(&failed, true), Disposition::Drop);
    }

    #[test]
    fn keys_join_exchange_and_kind() {
        assert_eq!(handler_key("alarm", &ExchangeKind::Fanout), "alarm:fanout");

        let registry = alarm_handler(Ok(()));
        assert!(registry.get("alarm:fanout").is_some());
        assert!(registry.get("alarm:topic").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn successful_handling_acks_once() {
        let (sink, _errors) = ErrorSink::channel();
        let dispatcher = dispatcher(alarm_handler(Ok(())), sink);
        let delivery = Delivery::new("alarm", b"{}".to_vec(), Arc::new(acking_once()));

        assert_eq!(
            dispatcher.dispatch(ExchangeKind::Fanout, delivery).await,
            Disposition::Ack
        );
    }

    #[tokio::test]
    async fn first_failure_is_requeued() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(false), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sink, _errors) = ErrorSink::channel();
        let handlers = alarm_handler(Err(AmqpError::ParsePayloadError("eof".to_owned())));
        let delivery = Delivery::new("alarm", b"{".to_vec(), Arc::new(acker));

        assert_eq!(
            dispatcher(handlers, sink)
                .dispatch(ExchangeKind::Fanout, delivery)
                .await,
            Disposition::Requeue
        );
    }

    #[tokio::test]
    async fn redelivered_failure_is_dropped() {
        let (sink, _errors) = ErrorSink::channel();
        let handlers = alarm_handler(Err(AmqpError::ParsePayloadError("eof".to_owned())));
        let delivery =
            Delivery::new("alarm", b"{".to_vec(), Arc::new(acking_once())).redelivered(true);

        assert_eq!(
            dispatcher(handlers, sink)
                .dispatch(ExchangeKind::Fanout, delivery)
                .await,
            Disposition::Drop
        );
    }

    #[tokio::test]
    async fn unknown_key_goes_through_the_failure_policy() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(false), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sink, _errors) = ErrorSink::channel();
        let delivery = Delivery::new("state", b"{}".to_vec(), Arc::new(acker));

        assert_eq!(
            dispatcher(alarm_handler(Ok(())), sink)
                .dispatch(ExchangeKind::Fanout, delivery)
                .await,
            Disposition::Requeue
        );
    }

    #[tokio::test]
    async fn settlement_failures_are_reported() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError("channel gone".to_owned())));

        let (sink, mut errors) = ErrorSink::channel();
        let delivery = Delivery::new("alarm", b"{}".to_vec(), Arc::new(acker));
        dispatcher(alarm_handler(Ok(())), sink)
            .dispatch(ExchangeKind::Fanout, delivery)
            .await;

        assert_eq!(
            errors.try_recv(),
            Ok(AmqpError::AckMessageError("channel gone".to_owned()))
        );
    }

    #[tokio::test]
    async fn run_declares_binds_and_serves_each_exchange() {
        let (settled_tx, mut settled) = mpsc::unbounded_channel();
        let acker: Arc<dyn Acknowledger> = Arc::new(RecordingAcker(settled_tx));
        let first = Delivery::new("alarm", b"{}".to_vec(), acker.clone());

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .withf(|def| {
                def.name() == "alarm"
                    && def.exchange_kind() == &ExchangeKind::Fanout
                    && !def.is_durable()
                    && !def.is_auto_delete()
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| {
                def.name().starts_with("alarm-")
                    && def.is_auto_delete()
                    && !def.is_durable()
                    && !def.is_exclusive()
            })
            .times(1)
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_bind_queue()
            .withf(|binding| {
                binding.exchange_name() == "alarm"
                    && binding.queue_name().starts_with("alarm-")
                    && binding.key() == "#"
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .return_once(move |_, _| Ok(futures_util::stream::iter(vec![Ok(first)]).boxed()));

        let (sink, _errors) = ErrorSink::channel();
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            Arc::new(channel),
            alarm_handler(Ok(())),
            sink,
            DispatcherConfigs::default(),
            token.clone(),
        );

        let serving = dispatcher.run().await.unwrap();
        let settlement = tokio::time::timeout(Duration::from_secs(1), settled.recv())
            .await
            .unwrap();
        assert_eq!(settlement, Some((true, false)));

        token.cancel();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn run_fails_when_the_queue_cannot_be_declared() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .returning(|_| Err(AmqpError::ChannelClosed));
        channel.expect_consume().never();

        let (sink, _errors) = ErrorSink::channel();
        let dispatcher = dispatcher_on(channel, sink);
        let queue = dispatcher.queue_name("alarm");

        assert_eq!(
            dispatcher.run().await.err(),
            Some(AmqpError::DeclareQueueError(queue))
        );
    }

    #[tokio::test]
    async fn one_exchange_with_two_kinds_is_rejected_before_declaring() {
        let handlers = alarm_handler(Ok(())).register(
            "alarm",
            ExchangeKind::Topic,
            Arc::new(Outcome(Ok(()))),
        );
        assert_eq!(
            handlers.validate(),
            Err(AmqpError::ConflictingExchangeKind("alarm".to_owned()))
        );

        // no expectations: any broker call fails the test
        let (sink, _errors) = ErrorSink::channel();
        let dispatcher = Dispatcher::new(
            Arc::new(MockBrokerChannel::new()),
            handlers,
            sink,
            DispatcherConfigs::default(),
            CancellationToken::new(),
        );

        assert_eq!(
            dispatcher.run().await.err(),
            Some(AmqpError::ConflictingExchangeKind("alarm".to_owned()))
        );
    }

    #[test]
    fn distinct_exchanges_may_use_different_kinds() {
        let handlers = alarm_handler(Ok(())).register(
            "state",
            ExchangeKind::Topic,
            Arc::new(Outcome(Ok(()))),
        );
        assert_eq!(handlers.validate(), Ok(()));
    }

    #[tokio::test]
    async fn ended_consumer_stream_is_reported() {
        let (sink, mut errors) = ErrorSink::channel();
        let (bus, _rx) = mpsc::channel(1);
        let stream = futures_util::stream::empty::<Result<Delivery, AmqpError>>().boxed();

        forward(
            stream,
            "alarm-1".to_owned(),
            ExchangeKind::Fanout,
            bus,
            sink,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            errors.try_recv().ok(),
            Some(AmqpError::ConsumerError("consumer of `alarm-1` ended".to_owned()))
        );
    }

    #[tokio::test]
    async fn cancelled_forwarder_stops_quietly() {
        let (sink, mut errors) = ErrorSink::channel();
        let (bus, _rx) = mpsc::channel(1);
        let stream = futures_util::stream::pending::<Result<Delivery, AmqpError>>().boxed();
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            forward(stream, "alarm-1".to_owned(), ExchangeKind::Fanout, bus, sink, token),
        )
        .await
        .unwrap();

        assert!(errors.try_recv().is_err());
    }

    fn dispatcher_on(channel: MockBrokerChannel, errors: ErrorSink) -> Dispatcher {
        Dispatcher::new(
            Arc::new(channel),
            alarm_handler(Ok(())),
            errors,
            DispatcherConfigs::default(),
            CancellationToken::new(),
        )
    }
}
