// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Pub/sub over fanout exchanges with a supervised connection and channel.
//!
//! [`client::MqClient`] keeps one connection and one channel alive, re-declaring
//! registered exchanges after every reconnect, and publishes to them.
//! [`dispatcher::Dispatcher`] consumes per-process queues and routes each
//! delivery to its handler, requeueing a failed delivery once before dropping it.

mod otel;
mod supervisor;

pub mod broker;
pub mod channel;
pub mod client;
pub mod configs;
pub mod console;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod link;
pub mod queue;
pub mod sink;
