// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! Exchange kinds, declaration arguments and the in-memory registry of the
//! exchanges this process has declared. The registry is replayed against every
//! freshly opened channel so exchanges survive a reconnect.

use crate::{broker::BrokerChannel, errors::AmqpError, sink::ErrorSink};
use std::{collections::HashMap, fmt, str::FromStr};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// The name the broker uses for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::UnknownExchangeKind(other.to_owned())),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange declaration.
///
/// Exchanges are declared transient: not durable, not auto-deleted, not
/// internal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
}

impl ExchangeDefinition {
    /// Creates a new fanout exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Fanout,
            durable: false,
            delete: false,
            internal: false,
            no_wait: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}

/// An exchange the process has declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
}

impl Exchange {
    fn definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.name).kind(self.kind.clone())
    }
}

/// Record of the exchanges declared by this process, keyed by name.
///
/// Entries are immutable once inserted: declaring a known name again is a no-op
/// even when the kind differs.
#[derive(Debug, Default)]
pub struct ExchangeRegistry {
    exchanges: Mutex<HashMap<String, Exchange>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name` on `channel` and records it, unless it is already known.
    ///
    /// The registry lock is held across the declare so concurrent callers for
    /// the same name reach the broker once.
    pub async fn declare(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        let mut exchanges = self.exchanges.lock().await;
        if exchanges.contains_key(name) {
            debug!(exchange = name, "exchange already declared");
            return Ok(());
        }

        let exchange = Exchange {
            name: name.to_owned(),
            kind,
        };

        channel
            .declare_exchange(&exchange.definition())
            .await
            .map_err(|err| {
                error!(error = %err, exchange = name, "unable to declare exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })?;

        exchanges.insert(name.to_owned(), exchange);
        Ok(())
    }

    /// Re-declares every registered exchange against `channel`.
    ///
    /// Failures are reported to `sink` one by one; the replay always visits
    /// every entry.
    pub async fn replay(&self, channel: &dyn BrokerChannel, sink: &ErrorSink) {
        let exchanges = self.exchanges.lock().await;
        for exchange in exchanges.values() {
            debug!(exchange = %exchange.name, kind = %exchange.kind, "re-declaring exchange");
            if let Err(err) = channel.declare_exchange(&exchange.definition()).await {
                sink.report(err);
            }
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.exchanges.lock().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<Exchange> {
        self.exchanges.lock().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.exchanges.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exchanges.lock().await.is_empty()
    }
}
