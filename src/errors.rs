// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! A single error enum is shared by the supervisors, the publish facade and the
//! delivery dispatcher. Connectivity failures never reach callers; they are
//! funneled into the [`ErrorSink`](crate::sink::ErrorSink). Registration and
//! send-time failures are returned synchronously. Handler failures drive the
//! ack/nack policy of the dispatcher.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker or handling a delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The broker closed a previously established connection
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The broker closed a previously opened channel
    #[error("channel closed: {0}")]
    ChannelClosedByBroker(String),

    /// No connection is currently established
    #[error("not connected to mq")]
    NotConnected,

    /// No channel is currently open
    #[error("channel is closed")]
    ChannelClosed,

    /// The exchange type string is not one the broker knows
    #[error("unknown exchange kind `{0}`")]
    UnknownExchangeKind(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Handlers were registered for one exchange under different kinds
    #[error("exchange `{0}` registered with more than one kind")]
    ConflictingExchangeKind(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The client was built for consuming only
    #[error("mq client is not for sending")]
    NotForSending,

    /// Publishing to an exchange that was never registered
    #[error("exchange `{0}` has not been created")]
    ExchangeNotCreated(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error parsing or serializing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// No handler is registered for the delivery's `<exchange>:<kind>` key
    #[error("no handler registered for `{0}`")]
    HandlerNotFound(String),

    /// A handler rejected the delivery for a domain reason
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error reading from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
