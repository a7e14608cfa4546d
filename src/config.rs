// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client Configuration
//!
//! Connection and consumer settings for the client. Values can be built in code,
//! deserialized from any serde source, or loaded from `RABBITMQ_*` environment
//! variables through [`RabbitMQConfigs::from_env`].

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;

/// Default prefetch count applied to listeners that do not override it.
pub const DEFAULT_QOS: u16 = 68;

/// Default number of confirm-mode channels kept by the publisher pool.
pub const DEFAULT_PUBLISHER_POOL_SIZE: usize = 20;

/// Prefix of the environment variables read by [`RabbitMQConfigs::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// Settings used to reach the broker and tune the consumer runtime.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Prefetch count for listeners without their own QoS.
    pub consumer_qos: u16,
    /// Number of confirm-mode channels opened for publishing on every connect.
    pub publisher_pool_size: usize,
    /// Name reported to the broker for the connection.
    pub connection_name: String,
    /// Retry cap applied to failed deliveries that carry no max-retry header.
    ///
    /// `None` keeps redelivering such messages until they are handled.
    pub default_max_retry: Option<i64>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            consumer_qos: DEFAULT_QOS,
            publisher_pool_size: DEFAULT_PUBLISHER_POOL_SIZE,
            connection_name: "rabbitmq-client".to_owned(),
            default_max_retry: None,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the configuration from `RABBITMQ_*` environment variables,
    /// e.g. `RABBITMQ_HOST`, `RABBITMQ_PORT` or `RABBITMQ_CONSUMER_QOS`.
    ///
    /// Variables that are not set keep their default value.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(env: Environment) -> Result<Self, AmqpError> {
        let cfg = Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<RabbitMQConfigs>())
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects settings the client cannot run with.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.is_empty() {
            return Err(AmqpError::ConfigError("host must not be empty".to_owned()));
        }

        if self.publisher_pool_size == 0 {
            return Err(AmqpError::ConfigError(
                "publisher_pool_size must be at least 1".to_owned(),
            ));
        }

        Ok(())
    }

    /// Builds the AMQP URI for this configuration.
    ///
    /// The vhost is percent-encoded, so the default vhost `/` becomes `%2f`.
    /// An empty vhost leaves the path out and lets the broker use its default.
    pub fn uri(&self) -> String {
        let base = format!(
            "amqp://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        );

        if self.vhost.is_empty() {
            return base;
        }

        format!("{}/{}", base, self.vhost.replace('/', "%2f"))
    }

    /// Same as [`uri`](Self::uri) with the password masked, for logging.
    pub(crate) fn redacted_uri(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.vhost)
    }
}
