// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Registrations for RabbitMQ
//!
//! This module provides types for registering RabbitMQ exchanges. Exchanges are
//! the routing mechanism in RabbitMQ that determine how messages are distributed
//! to queues. Registrations are declared on every (re)connect.

use crate::errors::AmqpError;
use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Any other exchange type provided by the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<&str> for ExchangeKind {
    /// Parses the broker name of an exchange type. An empty name means `direct`.
    fn from(kind: &str) -> Self {
        match kind {
            "" | "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name),
        }
    }
}

/// Registration of a RabbitMQ exchange.
///
/// Defaults to a non-durable direct exchange without extra properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeRegistration {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) properties: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeRegistration {
    /// Creates a new direct exchange registration with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    pub fn new(name: &str) -> ExchangeRegistration {
        ExchangeRegistration {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            properties: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: impl Into<ExchangeKind>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Adds a single declaration argument to the exchange.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    pub fn property(mut self, key: &str, value: AMQPValue) -> Self {
        self.properties.insert(ShortString::from(key), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Declares the exchange on the given channel immediately.
pub async fn declare_exchange(
    channel: &Channel,
    exch: &ExchangeRegistration,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", exch.name);

    match channel
        .exchange_declare(
            &exch.name,
            exch.kind.clone().into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: exch.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::from(exch.properties.clone()),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exch.name.as_str(),
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(exch.name.clone()))
        }
        _ => {
            debug!("exchange: {} was created", exch.name);
            Ok(())
        }
    }
}
