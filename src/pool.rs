// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bounded Channel Pool
//!
//! A fixed-capacity pool of shared channels. Borrowing waits until a channel is
//! idle, which is the backpressure point of publishing. Channels found closed on
//! borrow or on return are discarded: the pool shrinks and the channel is told
//! so it can recover, after which it may be [restored](ChannelPool::restore).
//!
//! The number of live channels never exceeds the capacity.

use crate::errors::AmqpError;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// An item the pool can hand out.
pub(crate) trait Poolable: Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    /// Called once the pool dropped the item because it was closed.
    fn discarded(&self) {}
}

struct PoolState<T> {
    idle: VecDeque<Arc<T>>,
    live: usize,
}

pub(crate) struct ChannelPool<T: Poolable> {
    capacity: usize,
    state: Mutex<PoolState<T>>,
    // one permit per idle item
    permits: Semaphore,
}

impl<T: Poolable> ChannelPool<T> {
    /// Creates an empty pool, items join it through [`restore`](Self::restore).
    pub(crate) fn new(capacity: usize) -> ChannelPool<T> {
        ChannelPool {
            capacity,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(capacity),
                live: 0,
            }),
            permits: Semaphore::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items owned by the pool, idle or borrowed.
    pub(crate) fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Adds an item to the pool.
    ///
    /// Returns `false` when the pool is closed, already full, or already holds
    /// this very item.
    pub(crate) fn restore(&self, item: Arc<T>) -> bool {
        if self.permits.is_closed() {
            return false;
        }

        {
            let mut state = self.state.lock();
            if state.live >= self.capacity || state.idle.iter().any(|i| Arc::ptr_eq(i, &item)) {
                return false;
            }
            state.live += 1;
            state.idle.push_back(item);
        }

        self.permits.add_permits(1);
        true
    }

    /// Borrows an idle item, waiting until one is available.
    ///
    /// Fails with [`AmqpError::NoChannelAvailable`] once the pool is closed.
    pub(crate) async fn borrow(&self) -> Result<Pooled<'_, T>, AmqpError> {
        loop {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| AmqpError::NoChannelAvailable)?;

            let Some(item) = self.state.lock().idle.pop_front() else {
                permit.forget();
                return Err(AmqpError::InternalError);
            };

            if item.is_closed() {
                self.discard(item, permit);
                continue;
            }

            return Ok(Pooled {
                pool: self,
                item: Some(item),
                permit: Some(permit),
            });
        }
    }

    /// Closes the pool: pending and future borrows fail, idle items are dropped.
    pub(crate) fn close(&self) {
        self.permits.close();
        let mut state = self.state.lock();
        let idle = state.idle.len();
        state.live -= idle;
        state.idle.clear();
    }

    fn discard(&self, item: Arc<T>, permit: SemaphorePermit<'_>) {
        permit.forget();
        self.state.lock().live -= 1;
        debug!("discarded closed channel from pool");
        item.discarded();
    }

    fn give_back(&self, item: Arc<T>, permit: SemaphorePermit<'_>) {
        if self.permits.is_closed() {
            permit.forget();
            self.state.lock().live -= 1;
            return;
        }

        self.state.lock().idle.push_back(item);
        drop(permit);
    }
}

/// An item borrowed from a [`ChannelPool`], returned to it on drop.
pub(crate) struct Pooled<'a, T: Poolable> {
    pool: &'a ChannelPool<T>,
    item: Option<Arc<T>>,
    permit: Option<SemaphorePermit<'a>>,
}

impl<T: Poolable> std::ops::Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // set until drop
        self.item.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Poolable> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let (Some(item), Some(permit)) = (self.item.take(), self.permit.take()) {
            if item.is_closed() {
                self.pool.discard(item, permit);
            } else {
                self.pool.give_back(item, permit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Default)]
    struct FakeChannel {
        closed: AtomicBool,
        discarded: AtomicUsize,
    }

    impl Poolable for FakeChannel {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn discarded(&self) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn filled(capacity: usize) -> (Arc<ChannelPool<FakeChannel>>, Vec<Arc<FakeChannel>>) {
        let pool = Arc::new(ChannelPool::new(capacity));
        let items: Vec<_> = (0..capacity).map(|_| Arc::new(FakeChannel::default())).collect();
        for item in &items {
            assert!(pool.restore(item.clone()));
        }
        (pool, items)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_borrowers_never_exceed_capacity() {
        let (pool, _items) = filled(20);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _channel = pool.borrow().await.unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_use.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 20);
        assert_eq!(pool.live(), 20);
        assert!(!pool.restore(Arc::new(FakeChannel::default())));
    }

    #[tokio::test]
    async fn closed_items_are_discarded() {
        let (pool, items) = filled(2);
        items[0].closed.store(true, Ordering::SeqCst);

        let borrowed = pool.borrow().await.unwrap();
        assert!(!borrowed.is_closed());
        assert_eq!(pool.live(), 1);
        assert_eq!(items[0].discarded.load(Ordering::SeqCst), 1);

        // closed while borrowed, dropped on return
        items[1].closed.store(true, Ordering::SeqCst);
        drop(borrowed);
        assert_eq!(pool.live(), 0);
        assert_eq!(items[1].discarded.load(Ordering::SeqCst), 1);

        // a recovered channel rejoins the pool
        items[0].closed.store(false, Ordering::SeqCst);
        assert!(pool.restore(items[0].clone()));
        assert!(!pool.restore(items[0].clone()));
        assert_eq!(pool.live(), 1);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn closing_fails_pending_borrowers() {
        let (pool, _items) = filled(1);
        let held = pool.borrow().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert_eq!(waiting.await.unwrap(), Err(AmqpError::NoChannelAvailable));

        drop(held);
        assert_eq!(pool.live(), 0);
        assert!(!pool.restore(Arc::new(FakeChannel::default())));
        assert_eq!(pool.capacity(), 1);
    }
}
