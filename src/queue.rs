// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Registrations for RabbitMQ
//!
//! This module provides the queue and binding registrations collaborators submit
//! before the client starts. Registrations are plain values: they are declared on
//! the broker by the [`topology`](crate::topology) module on every (re)connect.

use crate::{
    errors::AmqpError,
    redelivery::{self, REDELIVER_DELAY_MS},
    topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MESSAGE_TTL},
};
use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Routing key used by bindings that do not set one.
pub const DEFAULT_ROUTING_KEY: &str = "#";

/// Registration of a RabbitMQ queue.
///
/// Registering the same queue name twice is harmless, the queue is declared once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRegistration {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueRegistration {
    /// Creates a new, non-durable queue registration with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    pub fn new(name: &str) -> QueueRegistration {
        QueueRegistration {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registration of a queue-to-exchange binding.
///
/// Every binding also gets a redelivery queue keyed by its exchange and routing
/// key, see [`redelivery`](crate::redelivery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRegistration {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl BindingRegistration {
    /// Creates a new binding for the given queue.
    ///
    /// The exchange defaults to the empty string and the routing key to `#`.
    /// These should be set using the `exchange` and `routing_key` methods.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    pub fn new(queue: &str) -> BindingRegistration {
        BindingRegistration {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: DEFAULT_ROUTING_KEY.to_owned(),
        }
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding. An empty key falls back to `#`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = if key.is_empty() {
            DEFAULT_ROUTING_KEY.to_owned()
        } else {
            key.to_owned()
        };
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn routing_key_name(&self) -> &str {
        &self.routing_key
    }

    /// Name of the redelivery queue derived from this binding.
    pub fn redelivery_queue(&self) -> String {
        redelivery::redeliver_queue_name(&self.exchange_name, &self.routing_key)
    }

    /// Arguments of the redelivery queue: messages expire after the redelivery
    /// delay and are dead-lettered back to this binding's exchange and key.
    pub(crate) fn redelivery_args(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(REDELIVER_DELAY_MS)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.exchange_name.clone())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.routing_key.clone())),
        );

        args
    }
}

/// Declares the queue on the given channel immediately.
pub async fn declare_queue(channel: &Channel, def: &QueueRegistration) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);

    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = def.name, "failure to declare queue");
            Err(AmqpError::DeclareQueueError(def.name.clone()))
        }
        _ => {
            debug!("queue: {} was created", def.name);
            Ok(())
        }
    }
}

/// Declares the binding on the given channel immediately, together with its
/// redelivery queue.
///
/// The redelivery queue has no consumer. Messages placed on it expire after
/// [`REDELIVER_DELAY_MS`] and the broker routes them back to the original
/// exchange and routing key.
pub async fn declare_binding(
    channel: &Channel,
    binding: &BindingRegistration,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    if let Err(err) = channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        error!(error = err.to_string(), "error to bind queue to exchange");

        return Err(AmqpError::BindingExchangeToQueueError(
            binding.exchange_name.clone(),
            binding.queue_name.clone(),
        ));
    }

    let redelivery_queue = binding.redelivery_queue();

    match channel
        .queue_declare(
            &redelivery_queue,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::from(binding.redelivery_args()),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = binding.queue_name,
                "failure to declare redeliver queue"
            );
            Err(AmqpError::DeclareQueueError(redelivery_queue))
        }
        _ => {
            debug!(
                "declared redeliver queue: {} for: {}",
                redelivery_queue, binding.queue_name
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_defaults_to_wildcard_key() {
        let binding = BindingRegistration::new("q").exchange("ex");
        assert_eq!(binding.routing_key_name(), "#");

        let binding = binding.routing_key("");
        assert_eq!(binding.routing_key_name(), "#");

        let binding = binding.routing_key("order.created");
        assert_eq!(binding.routing_key_name(), "order.created");
    }

    #[test]
    fn redelivery_queue_dead_letters_to_binding() {
        let binding = BindingRegistration::new("q").exchange("ex").routing_key("key");
        assert_eq!(binding.redelivery_queue(), "redeliver_ex_key_5000");

        let args = binding.redelivery_args();
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(5000))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("ex")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("key")))
        );
    }

    #[test]
    fn queue_builder() {
        let queue = QueueRegistration::new("q").durable();
        assert_eq!(queue.name(), "q");
        assert!(queue.durable);
    }
}
