// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events
//!
//! The two event kinds exchanged by the demo: alarms and state changes, each
//! on its own fanout exchange.

use crate::{
    broker::Delivery,
    dispatcher::{DeliveryContext, DeliveryHandler, HandlerRegistry},
    errors::AmqpError,
    exchange::ExchangeKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const ALARM_EXCHANGE: &str = "alarm";
pub const STATE_EXCHANGE: &str = "state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmEvent {
    pub name: String,
    pub when: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateEvent {
    pub state: String,
    pub created_at: DateTime<Utc>,
}

/// Decodes a JSON delivery body.
pub fn decode<T: DeserializeOwned>(delivery: &Delivery) -> Result<T, AmqpError> {
    serde_json::from_slice(&delivery.body)
        .map_err(|err| AmqpError::ParsePayloadError(format!("unable to unmarshal data: {}", err)))
}

pub struct AlarmHandler;

#[async_trait]
impl DeliveryHandler for AlarmHandler {
    async fn handle(&self, ctx: &DeliveryContext, delivery: &Delivery) -> Result<(), AmqpError> {
        let event: AlarmEvent = decode(delivery)?;
        debug!(id = %ctx.correlation_id, alarm_event = ?event, "alarm!!");
        Ok(())
    }
}

pub struct StateHandler;

#[async_trait]
impl DeliveryHandler for StateHandler {
    async fn handle(&self, ctx: &DeliveryContext, delivery: &Delivery) -> Result<(), AmqpError> {
        let event: StateEvent = decode(delivery)?;
        debug!(id = %ctx.correlation_id, state_event = ?event, "new state");
        Ok(())
    }
}

/// Handlers for the alarm and state fanout exchanges.
pub fn default_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .register(ALARM_EXCHANGE, ExchangeKind::Fanout, Arc::new(AlarmHandler))
        .register(STATE_EXCHANGE, ExchangeKind::Fanout, Arc::new(StateHandler))
}
