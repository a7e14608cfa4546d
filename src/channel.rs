// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and the self-healing
//! [`ManagedChannel`] used by both the publisher pool and the consumers.
//!
//! A managed channel owns at most one broker channel at a time. Its owner
//! configures every fresh channel through [`ChannelStart`]. Every channel
//! reports its own broker-side close. Once the channel is reported lost (closed
//! by the broker, found closed by the pool, consumer cancelled), a background watcher
//! opens a new one on the current connection and runs the start routine again,
//! retrying every [`RETRY_INTERVAL`] until it succeeds, the connection is gone or
//! the connect cycle ends.
//!
//! Each installed channel gets a new generation number. Loss reports carry the
//! generation they are about, so late reports about a replaced channel are
//! ignored.

use crate::{config::RabbitMQConfigs, errors::AmqpError, pool::Poolable};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between two attempts to restart a lost channel.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Reply code sent when the client closes a channel or connection.
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP connection using the given configuration.
///
/// # Parameters
/// * `cfg` - Configuration containing RabbitMQ connection details like host, port, credentials, etc.
///
/// # Returns
/// * `Result<Connection, AmqpError>` - The established connection, or an error on failure.
pub async fn new_amqp_connection(cfg: &RabbitMQConfigs) -> Result<Connection, AmqpError> {
    info!("establish connection to rabbitmq: '{}'", cfg.redacted_uri());

    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    match Connection::connect(&cfg.uri(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }
}

/// Source of fresh channels, backed by the current connection.
#[async_trait]
pub(crate) trait ChannelSource: Send + Sync {
    async fn open_channel(&self) -> Result<Channel, AmqpError>;

    fn is_connected(&self) -> bool;
}

/// Start routine run on every fresh channel of a [`ManagedChannel`].
#[async_trait]
pub(crate) trait ChannelStart: Send + Sync {
    /// Configures `channel`. Implementations that consume must call
    /// [`ManagedChannel::notify_lost`] with the [generation](ManagedChannel::generation)
    /// of `channel` once their delivery stream ends.
    async fn do_start(&self, channel: &Channel, managed: &Arc<ManagedChannel>) -> Result<(), AmqpError>;
}

/// A broker channel that restarts itself after being lost.
pub(crate) struct ManagedChannel {
    name: String,
    source: Arc<dyn ChannelSource>,
    starter: Arc<dyn ChannelStart>,
    current: Mutex<Option<Channel>>,
    generation: AtomicU64,
    // generation of the last reported loss
    lost: AtomicU64,
    wake: Notify,
    cycle: CancellationToken,
}

impl ManagedChannel {
    /// Creates a managed channel living until `cycle` is cancelled.
    pub(crate) fn new(
        name: String,
        source: Arc<dyn ChannelSource>,
        starter: Arc<dyn ChannelStart>,
        cycle: CancellationToken,
    ) -> Arc<ManagedChannel> {
        Arc::new(ManagedChannel {
            name,
            source,
            starter,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            lost: AtomicU64::new(u64::MAX),
            wake: Notify::new(),
            cycle,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The current broker channel, if any.
    pub(crate) fn channel(&self) -> Option<Channel> {
        self.current.lock().clone()
    }

    /// Generation of the current channel, bumped whenever it is replaced or
    /// closed.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reports the channel of `generation` as unusable, waking up the watcher.
    ///
    /// Reports about a channel that has been replaced already are ignored.
    pub(crate) fn notify_lost(&self, generation: u64) {
        {
            let _current = self.current.lock();
            if self.generation() != generation {
                debug!(
                    channel = self.name.as_str(),
                    generation,
                    "ignoring loss of replaced channel"
                );
                return;
            }
            self.lost.store(generation, Ordering::SeqCst);
        }

        self.wake.notify_one();
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst) == self.generation()
    }

    fn install(&self, channel: Channel) -> u64 {
        let mut current = self.current.lock();
        *current = Some(channel);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Opens the first channel and runs the start routine.
    ///
    /// Errors are returned to the caller, the channel is closed. On success the
    /// recovery watcher is spawned.
    pub(crate) async fn first_start(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.open_and_start().await?;
        tokio::spawn(self.clone().watch());
        Ok(())
    }

    async fn open_and_start(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.close_current().await;

        let channel = self.source.open_channel().await?;
        let generation = self.install(channel.clone());

        let managed = Arc::downgrade(self);
        channel.on_error(move |err| {
            if let Some(managed) = managed.upgrade() {
                warn!(
                    error = err.to_string(),
                    channel = managed.name.as_str(),
                    "channel closed by broker"
                );
                managed.notify_lost(generation);
            }
        });

        if let Err(err) = self.starter.do_start(&channel, self).await {
            error!(
                error = err.to_string(),
                channel = self.name.as_str(),
                "failure to start channel"
            );
            self.close_current().await;
            return Err(err);
        }

        debug!(channel = self.name.as_str(), "channel started");
        Ok(())
    }

    async fn close_current(&self) {
        let previous = {
            let mut current = self.current.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            current.take()
        };

        if let Some(channel) = previous {
            if channel.status().connected() {
                if let Err(err) = channel.close(REPLY_SUCCESS, "channel replaced").await {
                    debug!(error = err.to_string(), "failure to close previous channel");
                }
            }
        }
    }

    async fn watch(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cycle.cancelled() => break,
                _ = self.wake.notified() => {}
            }

            if !self.is_lost() {
                continue;
            }

            warn!(channel = self.name.as_str(), "channel closed, trying to recover");

            if !self.retry_start().await {
                break;
            }

            info!(channel = self.name.as_str(), "channel recovered");
        }

        debug!(channel = self.name.as_str(), "channel watcher stopped");
    }

    /// Restarts the channel until it succeeds. Returns `false` when giving up
    /// because the connection is gone or the cycle ended.
    async fn retry_start(self: &Arc<Self>) -> bool {
        loop {
            if self.cycle.is_cancelled() {
                return false;
            }

            if !self.source.is_connected() {
                debug!(
                    channel = self.name.as_str(),
                    "connection is gone, channel will be recreated on reconnect"
                );
                return false;
            }

            match self.open_and_start().await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        channel = self.name.as_str(),
                        "failure to restart channel, retrying"
                    );

                    tokio::select! {
                        _ = self.cycle.cancelled() => return false,
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }
}

impl Poolable for ManagedChannel {
    fn is_closed(&self) -> bool {
        match &*self.current.lock() {
            Some(channel) => !channel.status().connected(),
            None => true,
        }
    }

    fn discarded(&self) {
        // no channel means a restart is already under way
        let generation = self.current.lock().as_ref().map(|_| self.generation());

        if let Some(generation) = generation {
            self.notify_lost(generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Disconnected {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSource for Disconnected {
        async fn open_channel(&self) -> Result<Channel, AmqpError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::ConnectionMissing)
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    struct NeverCalled;

    #[async_trait]
    impl ChannelStart for NeverCalled {
        async fn do_start(&self, _: &Channel, _: &Arc<ManagedChannel>) -> Result<(), AmqpError> {
            panic!("start routine must not run without a channel")
        }
    }

    fn managed(source: Arc<Disconnected>, cycle: CancellationToken) -> Arc<ManagedChannel> {
        ManagedChannel::new("test".to_owned(), source, Arc::new(NeverCalled), cycle)
    }

    #[tokio::test]
    async fn first_start_surfaces_connection_errors() {
        let source = Arc::new(Disconnected {
            opened: AtomicUsize::new(0),
        });
        let channel = managed(source.clone(), CancellationToken::new());

        let err = channel.first_start().await.unwrap_err();
        assert_eq!(err, AmqpError::ConnectionMissing);
        assert!(channel.channel().is_none());
        assert!(channel.is_closed());
        assert_eq!(channel.name(), "test");
    }

    #[tokio::test]
    async fn retry_gives_up_without_connection() {
        let source = Arc::new(Disconnected {
            opened: AtomicUsize::new(0),
        });
        let channel = managed(source.clone(), CancellationToken::new());

        assert!(!channel.retry_start().await);
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
    }

    #[derive(Default)]
    struct Refusing {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSource for Refusing {
        async fn open_channel(&self) -> Result<Channel, AmqpError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::ChannelError("refused".to_owned()))
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn loss_of_replaced_channel_is_ignored() {
        let source = Arc::new(Disconnected {
            opened: AtomicUsize::new(0),
        });
        let channel = managed(source, CancellationToken::new());
        let first = channel.generation();

        channel.notify_lost(first + 1);
        assert!(!channel.is_lost());

        channel.notify_lost(first);
        assert!(channel.is_lost());

        // replacing the channel settles the report
        channel.close_current().await;
        assert!(channel.generation() > first);
        assert!(!channel.is_lost());

        channel.notify_lost(first);
        assert!(!channel.is_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_channel_is_restarted_every_interval() {
        let source = Arc::new(Refusing::default());
        let cycle = CancellationToken::new();
        let channel = ManagedChannel::new(
            "test".to_owned(),
            source.clone(),
            Arc::new(NeverCalled),
            cycle.clone(),
        );
        let watcher = tokio::spawn(channel.clone().watch());

        channel.notify_lost(channel.generation() + 1);
        tokio::time::sleep(RETRY_INTERVAL * 3).await;
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);

        channel.notify_lost(channel.generation());
        tokio::time::sleep(RETRY_INTERVAL * 3 + RETRY_INTERVAL / 2).await;
        assert_eq!(source.opened.load(Ordering::SeqCst), 4);

        cycle.cancel();
        watcher.await.unwrap();
        tokio::time::sleep(RETRY_INTERVAL * 3).await;
        assert_eq!(source.opened.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn discarding_without_channel_does_not_restart() {
        let source = Arc::new(Disconnected {
            opened: AtomicUsize::new(0),
        });
        let channel = managed(source, CancellationToken::new());

        channel.discarded();
        assert!(!channel.is_lost());
    }

    #[tokio::test]
    async fn watcher_stops_with_cycle() {
        let source = Arc::new(Disconnected {
            opened: AtomicUsize::new(0),
        });
        let cycle = CancellationToken::new();
        let channel = managed(source, cycle.clone());

        let watcher = tokio::spawn(channel.clone().watch());
        cycle.cancel();
        watcher.await.unwrap();
        assert!(!channel.retry_start().await);
    }
}
