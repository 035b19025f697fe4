//! # Pool Manager
//!
//! Purpose: Map dial addresses to connection pools so every caller dialing
//! the same address shares one pool.
//!
//! Pools are created on first use through the map's entry API, so concurrent
//! first requests for one address never build two pools.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tcpkit_common::{Connection, DEFAULT_CONNECT_TIMEOUT, NetResult};
use tracing::debug;

use crate::pool::Pool;
use crate::pooled::PooledConnection;

/// Default lifetime of an idle pooled connection.
pub const DEFAULT_POOL_TTL: Duration = Duration::from_secs(10);

/// Settings applied to every pool a manager creates.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle lifetime of pooled connections; zero disables expiry.
    pub ttl: Duration,
    /// Dial timeout used by the pool factory.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_POOL_TTL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Address-keyed registry of connection pools.
#[derive(Debug, Default)]
pub struct PoolManager {
    config: PoolConfig,
    pools: DashMap<String, Pool<Connection>>,
}

impl PoolManager {
    /// Manager whose pools all use `config`.
    pub fn new(config: PoolConfig) -> Self {
        PoolManager {
            config,
            pools: DashMap::new(),
        }
    }

    /// Settings applied to every pool this manager creates.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the pool for `addr`, creating it on first use.
    pub fn pool(&self, addr: &str) -> Pool<Connection> {
        if let Some(pool) = self.pools.get(addr) {
            return pool.clone();
        }
        self.pools
            .entry(addr.to_string())
            .or_insert_with(|| self.build_pool(addr))
            .clone()
    }

    /// Checks out a connection to `addr`, dialing if its pool is empty.
    pub async fn connect(&self, addr: &str) -> NetResult<PooledConnection> {
        let pool = self.pool(addr);
        PooledConnection::acquire(&pool).await
    }

    /// Closes and forgets the pool for `addr`.
    pub fn remove(&self, addr: &str) -> bool {
        match self.pools.remove(addr) {
            Some((_, pool)) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    /// Closes every pool.
    pub fn close_all(&self) {
        for entry in self.pools.iter() {
            entry.value().close();
        }
        self.pools.clear();
    }

    /// Number of addresses with a pool.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pool has been created yet.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    fn build_pool(&self, addr: &str) -> Pool<Connection> {
        let target: Arc<str> = Arc::from(addr);
        let connect_timeout = self.config.connect_timeout;
        debug!(addr, ttl = ?self.config.ttl, "creating connection pool");

        let dial_target = Arc::clone(&target);
        Pool::builder()
            .ttl(self.config.ttl)
            .factory(move || {
                let addr = Arc::clone(&dial_target);
                async move { Connection::connect_timeout(&addr, connect_timeout).await }
            })
            .disposer(move |conn: Connection| {
                debug!(addr = %target, peer = ?conn.peer_addr(), "closing pooled connection");
            })
            .build()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
