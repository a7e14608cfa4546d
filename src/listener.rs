// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Listeners
//!
//! A listener consumes one queue. The consumer runtime only sees the
//! [`RabbitListener`] trait, so raw-text listeners ([`MsgListener`]) and
//! JSON-decoding listeners ([`JsonMsgListener`]) are handled uniformly.
//!
//! Every listener added to the client is wrapped in a [`PanicSafeListener`]: a
//! panicking handler is turned into a [`HandlerError::Panicked`] instead of
//! taking down its worker.

use crate::errors::HandlerError;
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{
    any::Any, backtrace::Backtrace, future::Future, marker::PhantomData, panic::AssertUnwindSafe,
    sync::Arc,
};
use tracing::error;

/// Result of handling one delivery.
pub type HandlerResult = Result<(), HandlerError>;

type BoxedHandler<T> = Arc<dyn Fn(Context, T) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Listener of a queue.
///
/// Returning an error from [`handle`](RabbitListener::handle) sends the delivery
/// through the redelivery path, returning `Ok` acknowledges it.
#[async_trait]
pub trait RabbitListener: Send + Sync {
    /// Name of the queue to consume.
    fn queue_name(&self) -> &str;

    /// Handles the payload of one delivery. `ctx` carries the trace context
    /// propagated through the message headers.
    async fn handle(&self, ctx: &Context, payload: &[u8]) -> HandlerResult;

    /// Number of workers processing deliveries concurrently. Values below 1 are
    /// treated as 1.
    fn concurrency(&self) -> usize {
        1
    }

    /// Prefetch count of this listener, `None` uses the client default.
    fn qos(&self) -> Option<u16> {
        None
    }

    /// Short description used in log lines.
    fn describe(&self) -> String {
        format!("Listener --> '{}'", self.queue_name())
    }
}

/// Listener receiving the payload as text.
pub struct MsgListener {
    queue_name: String,
    handler: BoxedHandler<String>,
    concurrency: usize,
    qos: Option<u16>,
}

impl MsgListener {
    /// Creates a listener for `queue` calling `handler` with the payload decoded
    /// as UTF-8 (invalid sequences are replaced).
    pub fn new<F, Fut>(queue: &str, handler: F) -> MsgListener
    where
        F: Fn(Context, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        MsgListener {
            queue_name: queue.to_owned(),
            handler: Arc::new(move |ctx, payload| handler(ctx, payload).boxed()),
            concurrency: 1,
            qos: None,
        }
    }

    /// Sets the number of concurrent workers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Overrides the prefetch count for this listener.
    pub fn with_qos(mut self, qos: u16) -> Self {
        self.qos = Some(qos);
        self
    }
}

#[async_trait]
impl RabbitListener for MsgListener {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn handle(&self, ctx: &Context, payload: &[u8]) -> HandlerResult {
        let payload = String::from_utf8_lossy(payload).into_owned();
        (self.handler)(ctx.clone(), payload).await
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn qos(&self) -> Option<u16> {
        self.qos
    }

    fn describe(&self) -> String {
        format!("MsgListener --> '{}'", self.queue_name)
    }
}

/// Listener decoding the JSON payload into `T` before calling its handler.
///
/// A payload that cannot be decoded fails with [`HandlerError::Decode`].
pub struct JsonMsgListener<T> {
    queue_name: String,
    handler: BoxedHandler<T>,
    concurrency: usize,
    qos: Option<u16>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonMsgListener<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new<F, Fut>(queue: &str, handler: F) -> JsonMsgListener<T>
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        JsonMsgListener {
            queue_name: queue.to_owned(),
            handler: Arc::new(move |ctx, payload| handler(ctx, payload).boxed()),
            concurrency: 1,
            qos: None,
            _payload: PhantomData,
        }
    }

    /// Sets the number of concurrent workers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Overrides the prefetch count for this listener.
    pub fn with_qos(mut self, qos: u16) -> Self {
        self.qos = Some(qos);
        self
    }
}

#[async_trait]
impl<T> RabbitListener for JsonMsgListener<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn handle(&self, ctx: &Context, payload: &[u8]) -> HandlerResult {
        let msg = serde_json::from_slice::<T>(payload)?;
        (self.handler)(ctx.clone(), msg).await
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn qos(&self) -> Option<u16> {
        self.qos
    }

    fn describe(&self) -> String {
        format!(
            "JsonMsgListener<{}> --> '{}'",
            std::any::type_name::<T>(),
            self.queue_name
        )
    }
}

/// Decorator recovering panics raised by the wrapped listener.
pub struct PanicSafeListener {
    inner: Arc<dyn RabbitListener>,
}

impl PanicSafeListener {
    pub fn new(inner: Arc<dyn RabbitListener>) -> PanicSafeListener {
        PanicSafeListener { inner }
    }
}

#[async_trait]
impl RabbitListener for PanicSafeListener {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    async fn handle(&self, ctx: &Context, payload: &[u8]) -> HandlerResult {
        match AssertUnwindSafe(self.inner.handle(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                // the stack has unwound already, this trace ends where the
                // panic was caught; the panic hook reports where it was raised
                error!(
                    listener = self.inner.describe(),
                    panic = msg.as_str(),
                    catch_site = %Backtrace::force_capture(),
                    "listener panicked while handling message, caught by its worker"
                );
                Err(HandlerError::Panicked(msg))
            }
        }
    }

    fn concurrency(&self) -> usize {
        self.inner.concurrency().max(1)
    }

    fn qos(&self) -> Option<u16> {
        self.inner.qos()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
