// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! The [`ConnectionManager`] owns the broker connection and runs the connect
//! cycle: dial, install the registered topology, start the publisher pool and
//! the consumers. A watcher task tears the cycle down once lapin reports the
//! connection lost and runs a new one until it succeeds, or until shutdown.
//!
//! Registrations are snapshotted at the start of every cycle, so anything
//! registered later only takes effect on the next connect.

use crate::{
    channel::{new_amqp_connection, ChannelSource, REPLY_SUCCESS},
    config::RabbitMQConfigs,
    consumer::Redelivery,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    publisher::RabbitMQPublisher,
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use lapin::{Channel, Connection, ConnectionStatus};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver},
    watch, Mutex as AsyncMutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before reconnecting after the connection was lost.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Delay between two failed reconnect attempts.
pub const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// State of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Owner of the broker connection and of everything living on it.
pub struct ConnectionManager {
    cfg: RabbitMQConfigs,
    topology: Mutex<AmqpTopology>,
    dispatcher: RabbitMQDispatcher,
    publisher: Arc<RabbitMQPublisher>,
    connection: AsyncMutex<Option<Connection>>,
    status: Mutex<Option<ConnectionStatus>>,
    state: watch::Sender<ConnectionState>,
    token: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(cfg: RabbitMQConfigs) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            cfg,
            topology: Mutex::new(AmqpTopology::new()),
            dispatcher: RabbitMQDispatcher::new(),
            publisher: RabbitMQPublisher::new(),
            connection: AsyncMutex::new(None),
            status: Mutex::new(None),
            state: watch::Sender::new(ConnectionState::Disconnected),
            token: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RabbitMQConfigs {
        &self.cfg
    }

    /// Applies `register` to the topology used by the next connect cycles.
    pub fn update_topology<F>(&self, register: F)
    where
        F: FnOnce(AmqpTopology) -> AmqpTopology,
    {
        let mut topology = self.topology.lock();
        *topology = register(std::mem::take(&mut *topology));
    }

    pub fn topology(&self) -> AmqpTopology {
        self.topology.lock().clone()
    }

    pub fn dispatcher(&self) -> &RabbitMQDispatcher {
        &self.dispatcher
    }

    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Connects, installs the topology and starts publishers and consumers,
    /// then keeps the connection alive until `shutdown` is cancelled or
    /// [`stop`](Self::stop) is called.
    ///
    /// A failure of this first connect is returned as is, nothing is retried.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ClientClosed);
        }

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyStarted);
        }

        let token = shutdown.child_token();
        *self.token.lock() = Some(token.clone());

        let cycle = token.child_token();
        match self.run_cycle(&cycle).await {
            Ok(errors) => {
                tokio::spawn(self.clone().watch(token, cycle, errors));
                Ok(())
            }
            Err(err) => {
                self.teardown(&cycle).await;
                *self.token.lock() = None;
                self.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Stops the client: publishes fail from now on and the connection is
    /// closed immediately.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(token) = self.token.lock().clone() {
            token.cancel();
        }

        self.state.send_replace(ConnectionState::ShuttingDown);
        self.publisher.close();
        self.close_connection().await;
        self.state.send_replace(ConnectionState::Disconnected);

        info!("rabbitmq client stopped");
    }

    /// Opens a channel on the current connection.
    pub async fn new_channel(&self) -> Result<Channel, AmqpError> {
        let connection = self.connection.lock().await;
        let Some(connection) = connection.as_ref() else {
            return Err(AmqpError::ConnectionMissing);
        };

        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "failure to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        Ok(channel)
    }

    fn source(self: &Arc<Self>) -> Arc<dyn ChannelSource> {
        Arc::new(ManagerSource(Arc::downgrade(self)))
    }

    /// Runs one connect cycle. Returns the receiver of connection errors.
    async fn run_cycle(
        self: &Arc<Self>,
        cycle: &CancellationToken,
    ) -> Result<UnboundedReceiver<lapin::Error>, AmqpError> {
        self.state.send_replace(ConnectionState::Connecting);

        let connection = new_amqp_connection(&self.cfg).await?;

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = errors_tx.send(err);
        });

        *self.status.lock() = Some(connection.status().clone());
        *self.connection.lock().await = Some(connection);

        let topology = self.topology();
        self.install(&topology).await?;

        let source = self.source();

        self.publisher
            .start(source.clone(), self.cfg.publisher_pool_size, cycle.clone())
            .await?;

        let redelivery = Arc::new(Redelivery::new(
            self.publisher.clone(),
            topology.redelivery_queues(),
            self.cfg.default_max_retry,
        ));

        self.dispatcher
            .start(source, self.cfg.consumer_qos, redelivery, cycle.clone())
            .await?;

        self.state.send_replace(ConnectionState::Connected);
        info!("rabbitmq connected");

        Ok(errors_rx)
    }

    /// Declares the topology through a temporary channel.
    async fn install(&self, topology: &AmqpTopology) -> Result<(), AmqpError> {
        let channel = self.new_channel().await?;
        let installed = topology.install(&channel).await;

        if let Err(err) = channel.close(REPLY_SUCCESS, "topology installed").await {
            debug!(error = err.to_string(), "failure to close topology channel");
        }

        installed
    }

    /// Ends a connect cycle: stops its channels, removes the publisher pool
    /// and closes the connection.
    async fn teardown(&self, cycle: &CancellationToken) {
        cycle.cancel();
        self.publisher.close();
        self.close_connection().await;

        if self.state() != ConnectionState::ShuttingDown {
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    async fn close_connection(&self) {
        self.status.lock().take();
        let connection = self.connection.lock().await.take();

        if let Some(connection) = connection {
            if connection.status().connected() {
                if let Err(err) = connection.close(REPLY_SUCCESS, "client closing").await {
                    debug!(error = err.to_string(), "failure to close connection");
                }
            }
        }
    }

    async fn watch(
        self: Arc<Self>,
        token: CancellationToken,
        mut cycle: CancellationToken,
        mut errors: UnboundedReceiver<lapin::Error>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                err = errors.recv() => match err {
                    Some(err) => error!(error = err.to_string(), "rabbitmq connection lost"),
                    None => warn!("rabbitmq connection dropped"),
                },
            }

            self.teardown(&cycle).await;

            match self.reconnect(&token).await {
                Some((next_cycle, next_errors)) => {
                    cycle = next_cycle;
                    errors = next_errors;
                }
                None => break,
            }
        }

        // shutdown is final, like stop
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::ShuttingDown);
        self.teardown(&cycle).await;
        self.state.send_replace(ConnectionState::Disconnected);

        debug!("connection watcher stopped");
    }

    /// Runs connect cycles until one succeeds. Returns `None` on shutdown.
    async fn reconnect(
        self: &Arc<Self>,
        token: &CancellationToken,
    ) -> Option<(CancellationToken, UnboundedReceiver<lapin::Error>)> {
        let mut delay = RECONNECT_DELAY;

        loop {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            info!("reconnecting to rabbitmq");

            let cycle = token.child_token();
            match self.run_cycle(&cycle).await {
                Ok(errors) => {
                    info!("rabbitmq reconnected");
                    return Some((cycle, errors));
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to reconnect, retrying");
                    self.teardown(&cycle).await;
                    delay = RECONNECT_RETRY_DELAY;
                }
            }
        }
    }
}

/// Channel source handed to the managed channels, not keeping the manager alive.
struct ManagerSource(Weak<ConnectionManager>);

#[async_trait]
impl ChannelSource for ManagerSource {
    async fn open_channel(&self) -> Result<Channel, AmqpError> {
        match self.0.upgrade() {
            Some(manager) => manager.new_channel().await,
            None => Err(AmqpError::ConnectionMissing),
        }
    }

    fn is_connected(&self) -> bool {
        let Some(manager) = self.0.upgrade() else {
            return false;
        };

        let connected = manager.status.lock().as_ref().is_some_and(|s| s.connected());
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> RabbitMQConfigs {
        RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 1,
            ..RabbitMQConfigs::default()
        }
    }

    #[tokio::test]
    async fn failed_start_is_returned() {
        let manager = ConnectionManager::new(unreachable());

        let err = manager.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionError(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert!(!manager.is_started());

        // a failed start can be retried
        let err = manager.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn stopped_manager_refuses_to_start() {
        let manager = ConnectionManager::new(unreachable());
        manager.stop().await;

        assert_eq!(
            manager.start(CancellationToken::new()).await,
            Err(AmqpError::ClientClosed)
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shut_down_manager_refuses_to_start() {
        let manager = ConnectionManager::new(unreachable());
        let token = CancellationToken::new();
        let (_errors, receiver) = tokio::sync::mpsc::unbounded_channel();

        let watcher = tokio::spawn(manager.clone().watch(
            token.clone(),
            token.child_token(),
            receiver,
        ));
        token.cancel();
        watcher.await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.start(CancellationToken::new()).await,
            Err(AmqpError::ClientClosed)
        );
    }

    #[tokio::test]
    async fn no_channel_without_connection() {
        let manager = ConnectionManager::new(unreachable());

        assert_eq!(
            manager.new_channel().await.unwrap_err(),
            AmqpError::ConnectionMissing
        );
        assert!(!manager.source().is_connected());
    }

    #[test]
    fn topology_updates_are_kept() {
        let manager = ConnectionManager::new(RabbitMQConfigs::default());
        manager.update_topology(|t| t.queue(crate::queue::QueueRegistration::new("Q")));
        manager.update_topology(|t| t.queue(crate::queue::QueueRegistration::new("Q")));

        assert_eq!(manager.topology().queues.len(), 1);
    }
}
