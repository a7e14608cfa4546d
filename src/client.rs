// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! [`RabbitMQClient`] is the entry point of the crate. Collaborators register
//! their queues, exchanges, bindings and listeners, start the client, then
//! publish through it.
//!
//! ```no_run
//! use opentelemetry::Context;
//! use rabbitmq_client::{
//!     client::RabbitMQClient, config::RabbitMQConfigs, exchange::ExchangeRegistration,
//!     listener::MsgListener, queue::{BindingRegistration, QueueRegistration},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), rabbitmq_client::errors::AmqpError> {
//! let client = RabbitMQClient::new(RabbitMQConfigs::from_env()?);
//!
//! client.register_exchange(ExchangeRegistration::new("orders").topic().durable());
//! client.register_queue(QueueRegistration::new("orders.created").durable());
//! client.register_binding(BindingRegistration::new("orders.created").exchange("orders").routing_key("created"));
//! client.add_listener(MsgListener::new("orders.created", |_, payload| async move {
//!     println!("{}", payload);
//!     Ok(())
//! }));
//!
//! client.start(CancellationToken::new()).await?;
//! client.publish_text(&Context::current(), "orders", "created", "hello").await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::RabbitMQConfigs,
    connection::{ConnectionManager, ConnectionState},
    errors::AmqpError,
    exchange::{declare_exchange, ExchangeRegistration},
    listener::RabbitListener,
    publisher::{HeaderValue, PublishMessage, Publisher},
    queue::{declare_binding, declare_queue, BindingRegistration, QueueRegistration},
    topology::Topology,
};
use lapin::Channel;
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// RabbitMQ client owning the registries and the connection.
#[derive(Clone)]
pub struct RabbitMQClient {
    manager: Arc<ConnectionManager>,
}

impl RabbitMQClient {
    pub fn new(cfg: RabbitMQConfigs) -> RabbitMQClient {
        RabbitMQClient {
            manager: ConnectionManager::new(cfg),
        }
    }

    /// Creates a client configured from the `RABBITMQ_*` environment variables.
    pub fn from_env() -> Result<RabbitMQClient, AmqpError> {
        Ok(RabbitMQClient::new(RabbitMQConfigs::from_env()?))
    }

    pub fn config(&self) -> &RabbitMQConfigs {
        self.manager.config()
    }

    pub fn register_queue(&self, def: QueueRegistration) {
        self.warn_if_started("queue", def.name());
        self.manager.update_topology(|t| t.queue(def));
    }

    pub fn register_exchange(&self, def: ExchangeRegistration) {
        self.warn_if_started("exchange", def.name());
        self.manager.update_topology(|t| t.exchange(def));
    }

    /// Registers a binding, its redelivery queue is declared with it.
    pub fn register_binding(&self, binding: BindingRegistration) {
        self.warn_if_started("binding", binding.queue_name());
        self.manager.update_topology(|t| t.queue_binding(binding));
    }

    /// Registers a listener. Panics raised by its handler are recovered.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: RabbitListener + 'static,
    {
        self.add_shared_listener(Arc::new(listener));
    }

    pub fn add_shared_listener(&self, listener: Arc<dyn RabbitListener>) {
        self.warn_if_started("listener", listener.queue_name());
        self.manager.dispatcher().register(listener);
    }

    fn warn_if_started(&self, kind: &str, name: &str) {
        if self.manager.is_started() {
            warn!(
                kind,
                name, "registered after start, it takes effect on the next connect"
            );
        }
    }

    /// Connects to the broker and starts publishers and listeners.
    ///
    /// The connection is kept alive, and restored when lost, until `shutdown`
    /// is cancelled or [`stop`](Self::stop) is called.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), AmqpError> {
        self.manager.start(shutdown).await
    }

    pub async fn stop(&self) {
        self.manager.stop().await
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe()
    }

    /// Publisher usable by collaborators holding a `dyn Publisher`.
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        self.manager.publisher()
    }

    pub async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        self.manager.publisher().publish(ctx, msg).await
    }

    pub async fn publish_json<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.manager
            .publisher()
            .publish_json(ctx, exchange, routing_key, payload)
            .await
    }

    pub async fn publish_json_with_headers<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        headers: HashMap<String, HeaderValue>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.manager
            .publisher()
            .publish_json_with_headers(ctx, exchange, routing_key, payload, Some(headers))
            .await
    }

    pub async fn publish_text(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        text: &str,
    ) -> Result<(), AmqpError> {
        self.manager
            .publisher()
            .publish_text(ctx, exchange, routing_key, text)
            .await
    }

    /// Opens a raw channel on the current connection, for ad-hoc declarations.
    pub async fn new_channel(&self) -> Result<Channel, AmqpError> {
        self.manager.new_channel().await
    }

    /// Declares a queue right away, without registering it.
    pub async fn declare_queue(&self, def: &QueueRegistration) -> Result<(), AmqpError> {
        self.with_channel(|channel| async move { declare_queue(&channel, def).await })
            .await
    }

    /// Declares an exchange right away, without registering it.
    pub async fn declare_exchange(&self, def: &ExchangeRegistration) -> Result<(), AmqpError> {
        self.with_channel(|channel| async move { declare_exchange(&channel, def).await })
            .await
    }

    /// Declares a binding and its redelivery queue right away, without
    /// registering it.
    pub async fn declare_binding(&self, binding: &BindingRegistration) -> Result<(), AmqpError> {
        self.with_channel(|channel| async move { declare_binding(&channel, binding).await })
            .await
    }

    async fn with_channel<F, Fut>(&self, declare: F) -> Result<(), AmqpError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: std::future::Future<Output = Result<(), AmqpError>>,
    {
        let channel = self.new_channel().await?;
        let declared = declare(channel.clone()).await;

        if let Err(err) = channel.close(crate::channel::REPLY_SUCCESS, "declared").await {
            tracing::debug!(error = err.to_string(), "failure to close declaration channel");
        }

        declared
    }
}
