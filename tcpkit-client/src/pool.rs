//! # TTL Pool
//!
//! Purpose: Keep reusable values (typically connections) for a bounded time,
//! handing out the oldest live one first and building new ones on demand.
//!
//! ## Design Principles
//! 1. **Lazy + Periodic Eviction**: `get` discards expired entries it meets;
//!    a background sweep trims the expired prefix once per second.
//! 2. **Monotonic Expiry**: Expiry instants come from `tokio::time::Instant`,
//!    so wall-clock jumps never expire or resurrect entries.
//! 3. **One-Way Close**: Closing stops the sweep, which then hands every
//!    remaining entry to the disposal callback exactly once.
//! 4. **Weak Sweep**: The sweep task never keeps the pool alive.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tcpkit_common::{NetError, NetResult};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::EntryQueue;

/// Period of the background expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Async constructor used when the pool has no live entry.
pub type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, NetResult<T>> + Send + Sync>;

/// Callback receiving every value the pool discards.
pub type Disposer<T> = Arc<dyn Fn(T) + Send + Sync>;

struct PoolEntry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> PoolEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct PoolInner<T> {
    queue: EntryQueue<PoolEntry<T>>,
    ttl: Duration,
    closed: AtomicBool,
    factory: Option<Factory<T>>,
    disposer: Option<Disposer<T>>,
    shutdown: CancellationToken,
}

impl<T> PoolInner<T> {
    fn dispose(&self, value: T) {
        match &self.disposer {
            Some(disposer) => disposer(value),
            None => drop(value),
        }
    }

    /// Pops the expired prefix; the first live entry goes back to the head.
    fn evict_expired(&self) {
        if self.ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut evicted = 0usize;
        while let Some(entry) = self.queue.pop_front() {
            if !entry.is_expired(now) {
                self.queue.push_front(entry);
                break;
            }
            self.dispose(entry.value);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.queue.len(), "pool sweep evicted expired entries");
        }
    }

    /// Appends `value` at the tail. A close that raced ahead of the push
    /// may already have drained the queue, so the entry is drained here.
    fn push(&self, value: T) {
        let expires_at = (!self.ttl.is_zero()).then(|| Instant::now() + self.ttl);
        self.queue.push_back(PoolEntry { value, expires_at });
        if self.closed.load(Ordering::Acquire) {
            self.drain();
        }
    }

    fn drain(&self) {
        let entries = self.queue.remove_all();
        let drained = entries.len();
        for entry in entries {
            self.dispose(entry.value);
        }
        debug!(drained, "pool closed, entries disposed");
    }
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Shared TTL pool handle; clones refer to the same pool.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("ttl", &self.inner.ttl)
            .field("len", &self.inner.queue.len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + Sync + 'static> Pool<T> {
    /// Pool without factory or disposal callback.
    ///
    /// A zero `ttl` means entries never expire. Must be called inside a tokio
    /// runtime, which hosts the sweep task.
    pub fn new(ttl: Duration) -> Self {
        PoolBuilder::new().ttl(ttl).build()
    }

    /// Starts a builder for pools with a factory or disposal callback.
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }

    /// Returns `value` to the tail of the pool.
    ///
    /// Fails with [`NetError::PoolClosed`] after [`Pool::close`]; the value is
    /// dropped in that case.
    pub fn put(&self, value: T) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::PoolClosed);
        }
        self.inner.push(value);
        Ok(())
    }

    /// Takes the oldest live value, or builds one with the factory.
    ///
    /// Expired entries met on the way are disposed. A closed pool skips its
    /// queue entirely, which is pending disposal.
    pub async fn get(&self) -> NetResult<T> {
        if !self.is_closed() {
            let now = Instant::now();
            while let Some(entry) = self.inner.queue.pop_front() {
                if entry.is_expired(now) {
                    self.inner.dispose(entry.value);
                    continue;
                }
                return Ok(entry.value);
            }
        }
        match &self.inner.factory {
            Some(factory) => factory().await,
            None => Err(NetError::PoolEmpty),
        }
    }

    /// Removes every entry, passing each to the disposal callback.
    pub fn clear(&self) {
        let entries = self.inner.queue.remove_all();
        if self.inner.disposer.is_some() {
            for entry in entries {
                self.inner.dispose(entry.value);
            }
        }
    }

    /// Closes the pool. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
    }

    /// Whether [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of queued entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Entry lifetime; zero means entries never expire.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }
}

/// Builder for [`Pool`].
pub struct PoolBuilder<T> {
    ttl: Duration,
    factory: Option<Factory<T>>,
    disposer: Option<Disposer<T>>,
}

impl<T> Default for PoolBuilder<T> {
    fn default() -> Self {
        PoolBuilder {
            ttl: Duration::ZERO,
            factory: None,
            disposer: None,
        }
    }
}

impl<T: Send + Sync + 'static> PoolBuilder<T> {
    pub fn new() -> Self {
        PoolBuilder::default()
    }

    /// Entry lifetime; zero disables expiry.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Constructor called when no live entry is available.
    pub fn factory<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NetResult<T>> + Send + 'static,
    {
        self.factory = Some(Arc::new(move || -> BoxFuture<'static, NetResult<T>> {
            Box::pin(factory())
        }));
        self
    }

    /// Callback for values the pool discards (expired, cleared or closed).
    pub fn disposer<F>(mut self, disposer: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.disposer = Some(Arc::new(disposer));
        self
    }

    /// Builds the pool and spawns its sweep task on the current runtime.
    pub fn build(self) -> Pool<T> {
        let inner = Arc::new(PoolInner {
            queue: EntryQueue::new(),
            ttl: self.ttl,
            closed: AtomicBool::new(false),
            factory: self.factory,
            disposer: self.disposer,
            shutdown: CancellationToken::new(),
        });
        spawn_sweeper(Arc::downgrade(&inner), inner.shutdown.clone());
        Pool { inner }
    }
}

fn spawn_sweeper<T: Send + Sync + 'static>(pool: Weak<PoolInner<T>>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else { return };
                    inner.evict_expired();
                }
            }
        }
        // Cancelled: either closed, or every handle dropped.
        if let Some(inner) = pool.upgrade() {
            inner.drain();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(ttl: Duration) -> (Pool<u32>, Arc<AtomicUsize>) {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let pool = Pool::builder()
            .ttl(ttl)
            .disposer(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        (pool, disposed)
    }

    #[tokio::test(start_paused = true)]
    async fn hands_out_in_fifo_order() {
        let pool = Pool::new(Duration::from_secs(10));
        pool.put(1).unwrap();
        pool.put(2).unwrap();
        pool.put(3).unwrap();

        assert_eq!(pool.get().await.unwrap(), 1);
        assert_eq!(pool.get().await.unwrap(), 2);
        assert_eq!(pool.get().await.unwrap(), 3);
        assert!(matches!(pool.get().await, Err(NetError::PoolEmpty)));
    }

    #[tokio::test(start_paused = true)]
    async fn get_discards_expired_entries() {
        let (pool, disposed) = counting_pool(Duration::from_secs(2));
        pool.put(1).unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        pool.put(2).unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;

        assert_eq!(pool.get().await.unwrap(), 2);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_expired_prefix() {
        let (pool, disposed) = counting_pool(Duration::from_secs(1));
        pool.put(1).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.put(2).unwrap();

        // The tick at t=1s expires the first entry only.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(pool.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_never_expires() {
        let (pool, disposed) = counting_pool(Duration::ZERO);
        pool.put(7).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(pool.get().await.unwrap(), 7);
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn factory_fills_empty_pool() {
        let pool = Pool::builder()
            .ttl(Duration::from_secs(1))
            .factory(|| async { Ok(42u32) })
            .build();

        assert_eq!(pool.get().await.unwrap(), 42);
        pool.put(5).unwrap();
        assert_eq!(pool.get().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_put_and_drains_once() {
        let (pool, disposed) = counting_pool(Duration::from_secs(60));
        for value in 0..3 {
            pool.put(value).unwrap();
        }

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.put(9), Err(NetError::PoolClosed)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(disposed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn push_racing_close_is_still_disposed() {
        let (pool, disposed) = counting_pool(Duration::from_secs(60));
        pool.put(1).unwrap();
        pool.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        // A put that passed its closed check before close lands after the
        // sweep's final drain.
        pool.inner.push(2);
        assert!(pool.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_pool_skips_queue_for_factory() {
        let pool = Pool::builder()
            .ttl(Duration::from_secs(60))
            .factory(|| async { Ok(99u32) })
            .build();
        pool.put(1).unwrap();
        pool.close();

        assert_eq!(pool.get().await.unwrap(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_pool_without_factory_is_empty() {
        let pool = Pool::new(Duration::from_secs(60));
        pool.put(1u32).unwrap();
        pool.close();

        assert!(matches!(pool.get().await, Err(NetError::PoolEmpty)));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_disposes_every_entry() {
        let (pool, disposed) = counting_pool(Duration::from_secs(60));
        pool.put(1).unwrap();
        pool.put(2).unwrap();

        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert!(!pool.is_closed());
    }
}
