// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ exchanges.
//! Messages go through a pool of confirm-mode channels: every publish borrows a
//! channel, sends the message and waits for the broker confirmation before the
//! channel is given back. OpenTelemetry trace context is propagated in the
//! message headers.

use crate::{
    channel::{ChannelSource, ChannelStart, ManagedChannel},
    errors::AmqpError,
    otel,
    pool::ChannelPool,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties, Channel,
};
use opentelemetry::Context;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// AMQP delivery mode of messages surviving a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Value of an application header.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> AMQPValue {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub headers: Option<HashMap<String, HeaderValue>>,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, content_type: &str, payload: Vec<u8>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content_type: content_type.to_owned(),
            payload,
            headers: None,
        }
    }

    /// Serializes `payload` as JSON.
    pub fn json<T>(exchange: &str, routing_key: &str, payload: &T) -> Result<Self, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        Ok(PublishMessage::new(exchange, routing_key, JSON_CONTENT_TYPE, payload))
    }

    pub fn text(exchange: &str, routing_key: &str, text: &str) -> Self {
        PublishMessage::new(exchange, routing_key, TEXT_CONTENT_TYPE, text.as_bytes().to_vec())
    }

    pub fn with_headers(mut self, headers: Option<HashMap<String, HeaderValue>>) -> Self {
        self.headers = headers;
        self
    }

    /// Adds a single header.
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value.into());
        self
    }
}

/// Publishes messages to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `msg` and waits for the broker confirmation.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated in the message headers
    /// * `msg` - The message to publish
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;
}

type Pool = ChannelPool<ManagedChannel>;

/// RabbitMQ implementation of the Publisher trait.
///
/// The pool is replaced on every connect cycle and removed when the connection
/// is lost or the client is stopped, failing publishes with
/// [`AmqpError::NoChannelAvailable`] in the meantime.
#[derive(Default)]
pub struct RabbitMQPublisher {
    pool: RwLock<Option<Arc<Pool>>>,
}

impl RabbitMQPublisher {
    /// Creates a publisher without channels.
    pub fn new() -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher::default())
    }

    /// Opens `size` confirm-mode channels and makes them the active pool.
    pub(crate) async fn start(
        &self,
        source: Arc<dyn ChannelSource>,
        size: usize,
        cycle: CancellationToken,
    ) -> Result<(), AmqpError> {
        let pool = Arc::new(Pool::new(size));
        let starter: Arc<dyn ChannelStart> = Arc::new(PublisherStarter {
            pool: Arc::downgrade(&pool),
        });

        for n in 0..size {
            let managed = ManagedChannel::new(
                format!("publisher-{}", n),
                source.clone(),
                starter.clone(),
                cycle.clone(),
            );

            if let Err(err) = managed.first_start().await {
                pool.close();
                return Err(err);
            }
        }

        debug!(
            "publisher pool started with {}/{} channels",
            pool.live(),
            pool.capacity()
        );

        if let Some(previous) = self.pool.write().replace(pool) {
            previous.close();
        }

        Ok(())
    }

    /// Closes the active pool, pending and future publishes fail.
    pub(crate) fn close(&self) {
        if let Some(pool) = self.pool.write().take() {
            pool.close();
        }
    }

    /// Number of live channels in the active pool.
    pub fn live_channels(&self) -> usize {
        self.pool.read().as_ref().map(|p| p.live()).unwrap_or_default()
    }

    fn active_pool(&self) -> Result<Arc<Pool>, AmqpError> {
        self.pool.read().clone().ok_or(AmqpError::NoChannelAvailable)
    }

    /// Publishes `payload` serialized as JSON.
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
        self.publish_json_with_headers(ctx, exchange, routing_key, payload, None)
            .await
    }

    /// Publishes `payload` serialized as JSON with extra headers.
    pub async fn publish_json_with_headers<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        headers: Option<HashMap<String, HeaderValue>>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let msg = PublishMessage::json(exchange, routing_key, payload)?.with_headers(headers);
        self.publish(ctx, &msg).await
    }

    /// Publishes `text` as a `text/plain` message.
    pub async fn publish_text(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        text: &str,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, &PublishMessage::text(exchange, routing_key, text))
            .await
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes a message to RabbitMQ.
    ///
    /// The message is persistent, carries a fresh message id and the trace
    /// context of `ctx` merged with its own headers. A channel found closed is
    /// discarded from the pool when given back, which triggers its recovery.
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the message, AmqpError otherwise
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let pool = self.active_pool()?;
        let managed = pool.borrow().await?;

        let Some(channel) = managed.channel() else {
            return Err(AmqpError::NoChannelAvailable);
        };

        let confirm = match channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                properties(ctx, msg),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = msg.exchange.as_str(),
                    "error publishing message"
                );
                return Err(AmqpError::PublishingError(err.to_string()));
            }
        };

        match confirm.await {
            Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => Ok(()),
            Ok(Confirmation::Ack(Some(_))) | Ok(Confirmation::Nack(_)) => {
                warn!(exchange = msg.exchange.as_str(), "message declined by broker");
                Err(AmqpError::BrokerDeclined(msg.exchange.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = msg.exchange.as_str(),
                    "server failed to confirm message"
                );
                Err(AmqpError::NotConfirmed(msg.exchange.clone()))
            }
        }
    }
}

/// Start routine of the pooled channels: enable confirms, then join the pool.
struct PublisherStarter {
    pool: Weak<Pool>,
}

#[async_trait]
impl ChannelStart for PublisherStarter {
    async fn do_start(&self, channel: &Channel, managed: &Arc<ManagedChannel>) -> Result<(), AmqpError> {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ConfirmSelectError(err.to_string()));
        }

        match self.pool.upgrade() {
            Some(pool) if pool.restore(managed.clone()) => {}
            _ => debug!(channel = managed.name(), "channel not restored, pool closed or full"),
        }

        Ok(())
    }
}

fn properties(ctx: &Context, msg: &PublishMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(msg.content_type.clone()))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(outbound_headers(ctx, msg.headers.as_ref()))
}

/// Trace propagation keys merged with the application headers, the latter
/// winning on conflicts.
fn outbound_headers(ctx: &Context, headers: Option<&HashMap<String, HeaderValue>>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    otel::inject_context(ctx, &mut btree);

    for (key, value) in headers.into_iter().flatten() {
        btree.insert(ShortString::from(key.clone()), value.clone().into());
    }

    FieldTable::from(btree)
}
