// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! This module provides the error types used across the client. `AmqpError`
//! covers everything that can go wrong while talking to the broker (connecting,
//! declaring topology, publishing, settling deliveries), while `HandlerError`
//! is the result type of listener code.
//!
//! Only errors a caller can act on are returned from public operations: startup
//! failures and publish failures. Everything else is logged and handled through
//! reconnection or redelivery.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the operation that failed. Variants carrying a `String`
/// hold either the name of the involved broker entity or the underlying
/// broker/driver error message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error loading or validating the client configuration
    #[error("invalid rabbitmq configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection is missing or was closed
    #[error("rabbitmq connection is missing")]
    ConnectionMissing,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error putting a channel into publisher-confirm mode
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The publisher pool could not produce a usable channel
    #[error("no channel available, unable to publish message")]
    NoChannelAvailable,

    /// Error transmitting a message to the broker
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively acknowledged or returned the message
    #[error("message declined by broker, exchange `{0}`")]
    BrokerDeclined(String),

    /// The broker failed to confirm the message
    #[error("message not published, server failed to confirm, exchange `{0}` probably doesn't exist")]
    NotConfirmed(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The client was started twice
    #[error("rabbitmq client already started")]
    AlreadyStarted,

    /// The client was stopped and no longer accepts work
    #[error("rabbitmq client is closed")]
    ClientClosed,
}

/// Error returned by a listener when a delivery could not be handled.
///
/// Any variant triggers the redelivery path of the consumer runtime.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload could not be decoded into what the listener expects
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// The application handler reported a failure
    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),

    /// The handler panicked, the panic was recovered
    #[error("listener panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Creates a `Failed` error from anything printable.
    pub fn failed(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        HandlerError::Failed(msg.into())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        HandlerError::Failed(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}
