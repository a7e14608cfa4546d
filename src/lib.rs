// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
mod pool;

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod listener;
pub mod publisher;
pub mod queue;
pub mod redelivery;
pub mod topology;

pub use client::RabbitMQClient;
pub use config::RabbitMQConfigs;
pub use connection::ConnectionState;
pub use errors::{AmqpError, HandlerError};
pub use listener::{HandlerResult, JsonMsgListener, MsgListener, RabbitListener};
pub use publisher::{HeaderValue, PublishMessage, Publisher};
