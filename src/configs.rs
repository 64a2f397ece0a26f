// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Broker location, supervision delays and dispatcher settings. Values start
//! from defaults, can be deserialized from any serde source, and are
//! overridden from the environment by [`Configs::from_env`].

use serde::Deserialize;
use std::time::Duration;

/// Top level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub supervisor: SupervisorConfigs,
    pub dispatcher: DispatcherConfigs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    /// Reported to the broker as the connection name.
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "mqplay".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Full AMQP URI; takes precedence over the individual fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
        }
    }
}

/// Delays used by the connection and channel supervisors, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfigs {
    /// Pause after an established connection is closed.
    pub connection_backoff_ms: u64,
    /// Pause after a failed dial.
    pub dial_retry_delay_ms: u64,
    /// Pause after a channel is closed, and poll interval while disconnected.
    pub channel_backoff_ms: u64,
    /// Pause after a failed channel open; zero retries on the next turn.
    pub channel_retry_delay_ms: u64,
}

impl Default for SupervisorConfigs {
    fn default() -> Self {
        Self {
            connection_backoff_ms: 5_000,
            dial_retry_delay_ms: 5_000,
            channel_backoff_ms: 10_000,
            channel_retry_delay_ms: 0,
        }
    }
}

impl SupervisorConfigs {
    pub fn connection_backoff(&self) -> Duration {
        Duration::from_millis(self.connection_backoff_ms)
    }

    pub fn dial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dial_retry_delay_ms)
    }

    pub fn channel_backoff(&self) -> Duration {
        Duration::from_millis(self.channel_backoff_ms)
    }

    pub fn channel_retry_delay(&self) -> Duration {
        Duration::from_millis(self.channel_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfigs {
    /// Capacity of the shared delivery bus.
    pub bus_capacity: usize,
    /// Routing key every per-process queue is bound with.
    pub binding_key: String,
}

impl Default for DispatcherConfigs {
    fn default() -> Self {
        Self {
            bus_capacity: 1,
            binding_key: "#".to_owned(),
        }
    }
}

impl Configs {
    /// Defaults overridden by `APP_NAME`, `RABBITMQ_URL`, `RABBITMQ_HOST`,
    /// `RABBITMQ_PORT`, `RABBITMQ_USER`, `RABBITMQ_PASSWORD` and `RABBITMQ_VHOST`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("APP_NAME") {
            self.app.name = name;
        }
        if let Some(url) = lookup("RABBITMQ_URL") {
            self.rabbitmq.url = Some(url);
        }
        if let Some(host) = lookup("RABBITMQ_HOST") {
            self.rabbitmq.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT").and_then(|p| p.parse().ok()) {
            self.rabbitmq.port = port;
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            self.rabbitmq.user = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            self.rabbitmq.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            self.rabbitmq.vhost = vhost;
        }
    }

    /// The URI the connection supervisor dials.
    pub fn amqp_uri(&self) -> String {
        if let Some(url) = &self.rabbitmq.url {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.rabbitmq.user,
            self.rabbitmq.password,
            self.rabbitmq.host,
            self.rabbitmq.port,
            self.rabbitmq.vhost
        )
    }
}
