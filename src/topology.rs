// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module holds the topology collaborators register before the client
//! starts: exchanges, queues and the bindings between them. The topology is
//! installed on every successful (re)connect, so the broker always ends up with
//! the same declarations even after a restart.
//!
//! Installing a binding also installs its redelivery queue, see
//! [`redelivery`](crate::redelivery).
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait for RabbitMQ
//! - Header constants: Constants for RabbitMQ queue arguments

use crate::{
    errors::AmqpError,
    exchange::{declare_exchange, ExchangeRegistration},
    queue::{declare_binding, declare_queue, BindingRegistration, QueueRegistration},
};
use async_trait::async_trait;
use lapin::Channel;
use std::collections::HashSet;
use tracing::debug;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange registration to the topology.
    fn exchange(self, def: ExchangeRegistration) -> Self;

    /// Adds a queue registration to the topology.
    fn queue(self, def: QueueRegistration) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: BindingRegistration) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self, channel: &Channel) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
///
/// Registrations are append-only. Queues are kept unique by name, repeated
/// registrations of the same queue are ignored.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) queues: Vec<QueueRegistration>,
    pub(crate) exchanges: Vec<ExchangeRegistration>,
    pub(crate) queues_binding: Vec<BindingRegistration>,
}

impl AmqpTopology {
    /// Creates an empty topology.
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Names of the redelivery queues declared by [`install`](Topology::install),
    /// one for each binding.
    pub fn redelivery_queues(&self) -> HashSet<String> {
        self.queues_binding
            .iter()
            .map(BindingRegistration::redelivery_queue)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.exchanges.is_empty() && self.queues_binding.is_empty()
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeRegistration) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueRegistration) -> Self {
        if self.queues.iter().any(|q| q.name == def.name) {
            debug!("queue: {} already registered", def.name);
            return self;
        }

        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: BindingRegistration) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all queues
    /// 2. Creates all exchanges
    /// 3. Binds queues to exchanges, declaring a redelivery queue per binding
    ///
    /// The first failing declaration aborts the installation.
    async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        for queue in &self.queues {
            declare_queue(channel, queue).await?;
        }

        for exch in &self.exchanges {
            declare_exchange(channel, exch).await?;
        }

        for binding in &self.queues_binding {
            declare_binding(channel, binding).await?;
        }

        debug!("topology installed");

        Ok(())
    }
}
