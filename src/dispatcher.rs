// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module holds the registered listeners and runs their consumers. On
//! every connect cycle each listener gets its own managed channel, configured
//! with the listener prefetch count, and a pool of workers sharing the delivery
//! stream of that channel.
//!
//! When the stream ends while the cycle is still running (channel closed by the
//! broker, consumer cancelled) the managed channel is reported lost and its
//! consumer is recreated on a fresh channel.

use crate::{
    channel::{ChannelSource, ChannelStart, ManagedChannel},
    consumer::{consume, Redelivery},
    errors::AmqpError,
    listener::{PanicSafeListener, RabbitListener},
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Consumer,
};
use opentelemetry::global;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registry of the listeners consumed by the client.
#[derive(Default)]
pub struct RabbitMQDispatcher {
    listeners: Mutex<Vec<Arc<dyn RabbitListener>>>,
}

impl RabbitMQDispatcher {
    pub fn new() -> Self {
        RabbitMQDispatcher::default()
    }

    /// Registers a listener, protected against panics.
    ///
    /// Listeners are started on the next connect cycle.
    pub fn register(&self, listener: Arc<dyn RabbitListener>) {
        debug!("registering {}", listener.describe());
        self.listeners
            .lock()
            .push(Arc::new(PanicSafeListener::new(listener)));
    }

    /// Snapshot of the registered listeners.
    pub fn listeners(&self) -> Vec<Arc<dyn RabbitListener>> {
        self.listeners.lock().clone()
    }

    /// Starts a consumer for every registered listener.
    ///
    /// # Parameters
    /// * `source` - Source of channels of the current connection
    /// * `default_qos` - Prefetch count of listeners without their own
    /// * `redelivery` - Redelivery settings of the current connect cycle
    /// * `cycle` - Token cancelled when the connect cycle ends
    ///
    /// # Returns
    /// Ok(()) once all consumers are running, the first failure otherwise
    pub(crate) async fn start(
        &self,
        source: Arc<dyn ChannelSource>,
        default_qos: u16,
        redelivery: Arc<Redelivery>,
        cycle: CancellationToken,
    ) -> Result<(), AmqpError> {
        for listener in self.listeners() {
            let qos = listener.qos().unwrap_or(default_qos);
            let name = format!("consumer-{}", listener.queue_name());

            let starter = Arc::new(ListenerConsumer {
                listener,
                qos,
                redelivery: redelivery.clone(),
                cycle: cycle.clone(),
            });

            ManagedChannel::new(name, source.clone(), starter, cycle.clone())
                .first_start()
                .await?;
        }

        Ok(())
    }
}

/// Start routine of a consumer channel.
struct ListenerConsumer {
    listener: Arc<dyn RabbitListener>,
    qos: u16,
    redelivery: Arc<Redelivery>,
    cycle: CancellationToken,
}

#[async_trait]
impl ChannelStart for ListenerConsumer {
    async fn do_start(&self, channel: &Channel, managed: &Arc<ManagedChannel>) -> Result<(), AmqpError> {
        let queue = self.listener.queue_name();

        if let Err(err) = channel
            .basic_qos(self.qos, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), queue, "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
        }

        let consumer = match channel
            .basic_consume(
                queue,
                &format!("{}-{}", queue, Uuid::new_v4()),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to create the consumer");
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }
            Ok(c) => c,
        };

        debug!(queue, qos = self.qos, "consumer declared");

        tokio::spawn(supervise(
            self.listener.clone(),
            consumer,
            self.redelivery.clone(),
            managed.clone(),
            managed.generation(),
            self.cycle.clone(),
        ));

        Ok(())
    }
}

/// Runs the workers of one consumer and reports the channel lost once they all
/// stopped before the end of the cycle.
async fn supervise(
    listener: Arc<dyn RabbitListener>,
    consumer: Consumer,
    redelivery: Arc<Redelivery>,
    managed: Arc<ManagedChannel>,
    generation: u64,
    cycle: CancellationToken,
) {
    let stream = Arc::new(AsyncMutex::new(consumer));

    let workers = (0..listener.concurrency().max(1)).map(|n| {
        tokio::spawn(work(
            n,
            listener.clone(),
            stream.clone(),
            redelivery.clone(),
            cycle.clone(),
        ))
    });

    for res in join_all(workers).await {
        if let Err(err) = res {
            error!(error = err.to_string(), "consumer worker failed");
        }
    }

    if !cycle.is_cancelled() {
        warn!(queue = listener.queue_name(), "delivery stream ended");
        managed.notify_lost(generation);
    }
}

async fn work(
    n: usize,
    listener: Arc<dyn RabbitListener>,
    stream: Arc<AsyncMutex<Consumer>>,
    redelivery: Arc<Redelivery>,
    cycle: CancellationToken,
) {
    let name = format!("{}-{}", n, listener.describe());
    info!("{} started", name);

    let tracer = global::tracer("amqp consumer");

    loop {
        let next = tokio::select! {
            _ = cycle.cancelled() => break,
            next = async { stream.lock().await.next().await } => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) = consume(&tracer, &delivery, listener.as_ref(), &redelivery).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => break,
        }
    }

    info!("{} stopped", name);
}
