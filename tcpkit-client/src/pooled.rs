//! # Pooled Connection
//!
//! Purpose: Borrow a [`Connection`] from a [`Pool`] and recover once from a
//! stale connection by swapping in a fresh one.
//!
//! ## Design Principles
//! 1. **Composition**: The pooled handle owns a plain `Connection` and wraps
//!    each of its operations; nothing is reimplemented.
//! 2. **One Recovery Per Operation**: A failure while health is `Unknown` or
//!    `Error` triggers exactly one reacquisition and one rerun.
//! 3. **RAII Return**: Dropping the handle puts the connection back into its
//!    pool unless the last operation failed.

use std::time::Duration;

use tcpkit_common::{Connection, FrameOption, NetError, NetResult, RecvResult, Retry};
use tracing::{debug, warn};

use crate::pool::Pool;

/// Outcome of the most recent operation on a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// No operation has run yet.
    #[default]
    Unknown,
    /// The last operation succeeded.
    Active,
    /// The last operation failed.
    Error,
}

/// Connection checked out of a [`Pool`].
#[derive(Debug)]
pub struct PooledConnection {
    pool: Pool<Connection>,
    conn: Option<Connection>,
    health: Health,
}

impl PooledConnection {
    /// Wraps `conn`, which will return to `pool` when the handle is dropped.
    pub fn new(pool: Pool<Connection>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            health: Health::Unknown,
        }
    }

    /// Checks a connection out of `pool`, dialing through its factory if empty.
    pub async fn acquire(pool: &Pool<Connection>) -> NetResult<Self> {
        let conn = pool.get().await?;
        Ok(PooledConnection::new(pool.clone(), conn))
    }

    /// Outcome of the most recent operation.
    pub fn health(&self) -> Health {
        self.health
    }

    /// Pool this handle returns its connection to.
    pub fn pool(&self) -> &Pool<Connection> {
        &self.pool
    }

    /// The active connection, for deadline tuning and address queries.
    pub fn connection(&mut self) -> NetResult<&mut Connection> {
        self.conn.as_mut().ok_or(NetError::Closed)
    }

    /// Returns the connection to the pool now (same as dropping the handle).
    pub fn release(self) {
        drop(self);
    }

    /// Shuts the connection down instead of returning it to the pool.
    pub async fn close(mut self) -> NetResult<()> {
        match self.conn.take() {
            Some(mut conn) => conn.shutdown().await,
            None => Ok(()),
        }
    }

    /// Runs `op`, reacquiring the connection once if it fails while the
    /// health is not `Active`.
    async fn with_recovery<T, E, F>(&mut self, mut op: F) -> Result<T, E>
    where
        F: AsyncFnMut(&mut Connection) -> Result<T, E>,
        E: From<NetError> + std::fmt::Display,
    {
        let conn = self.conn.as_mut().ok_or(NetError::Closed)?;
        let err = match op(conn).await {
            Ok(value) => {
                self.health = Health::Active;
                return Ok(value);
            }
            Err(err) => err,
        };
        if self.health == Health::Active {
            self.health = Health::Error;
            return Err(err);
        }

        warn!(error = %err, health = ?self.health, "pooled connection failed, reacquiring");
        let replacement = match self.pool.get().await {
            Ok(conn) => conn,
            Err(reacquire) => {
                self.health = Health::Error;
                return Err(reacquire.into());
            }
        };
        let conn = self.conn.insert(replacement);
        let result = op(conn).await;
        self.health = if result.is_ok() {
            Health::Active
        } else {
            Health::Error
        };
        result
    }
}

// ============================================================================
// Delegated raw operations
// ============================================================================

impl PooledConnection {
    /// [`Connection::send`] with one reacquisition on failure.
    pub async fn send(&mut self, data: &[u8], retry: Option<Retry>) -> NetResult<()> {
        self.with_recovery(async |conn: &mut Connection| conn.send(data, retry).await)
            .await
    }

    /// [`Connection::send_with_timeout`] with one reacquisition on failure.
    pub async fn send_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        retry: Option<Retry>,
    ) -> NetResult<()> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.send_with_timeout(data, timeout, retry).await
        })
        .await
    }

    /// [`Connection::recv`] with one reacquisition on failure.
    pub async fn recv(&mut self, length: usize, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.recv(length, retry).await)
            .await
    }

    /// [`Connection::recv_with_timeout`] with one reacquisition on failure.
    pub async fn recv_with_timeout(
        &mut self,
        length: usize,
        timeout: Duration,
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.recv_with_timeout(length, timeout, retry).await
        })
        .await
    }

    /// [`Connection::recv_available`] with one reacquisition on failure.
    pub async fn recv_available(&mut self, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.recv_available(retry).await)
            .await
    }

    /// [`Connection::recv_some`] with one reacquisition on failure.
    pub async fn recv_some(&mut self, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.recv_some(retry).await)
            .await
    }

    /// [`Connection::recv_til`] with one reacquisition on failure.
    pub async fn recv_til(
        &mut self,
        delimiter: &[u8],
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.recv_til(delimiter, retry).await)
            .await
    }

    /// [`Connection::recv_line`] with one reacquisition on failure.
    pub async fn recv_line(&mut self, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.recv_line(retry).await)
            .await
    }

    /// [`Connection::send_recv`]; a failed exchange is rerun on a fresh connection.
    pub async fn send_recv(
        &mut self,
        data: &[u8],
        length: usize,
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.send_recv(data, length, retry).await
        })
        .await
    }

    /// [`Connection::send_recv_with_timeout`] with one reacquisition on failure.
    pub async fn send_recv_with_timeout(
        &mut self,
        data: &[u8],
        length: usize,
        timeout: Duration,
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.send_recv_with_timeout(data, length, timeout, retry).await
        })
        .await
    }
}

// ============================================================================
// Delegated frame operations
// ============================================================================

impl PooledConnection {
    /// Frame send, see [`Connection::send_pkg`].
    pub async fn send_pkg(&mut self, data: &[u8], option: FrameOption) -> NetResult<()> {
        self.with_recovery(async |conn: &mut Connection| conn.send_pkg(data, option).await)
            .await
    }

    /// Frame receive, see [`Connection::recv_pkg`].
    pub async fn recv_pkg(&mut self, option: FrameOption) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.recv_pkg(option).await)
            .await
    }

    /// [`Connection::send_pkg_with_timeout`] with one reacquisition on failure.
    pub async fn send_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        option: FrameOption,
    ) -> NetResult<()> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.send_pkg_with_timeout(data, timeout, option).await
        })
        .await
    }

    /// [`Connection::recv_pkg_with_timeout`] with one reacquisition on failure.
    pub async fn recv_pkg_with_timeout(
        &mut self,
        timeout: Duration,
        option: FrameOption,
    ) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.recv_pkg_with_timeout(timeout, option).await
        })
        .await
    }

    /// Frame request/response, see [`Connection::send_recv_pkg`].
    pub async fn send_recv_pkg(&mut self, data: &[u8], option: FrameOption) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| conn.send_recv_pkg(data, option).await)
            .await
    }

    /// [`Connection::send_recv_pkg_with_timeout`] with one reacquisition on failure.
    pub async fn send_recv_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        option: FrameOption,
    ) -> RecvResult<Vec<u8>> {
        self.with_recovery(async |conn: &mut Connection| {
            conn.send_recv_pkg_with_timeout(data, timeout, option).await
        })
        .await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.health == Health::Error {
            debug!(peer = ?conn.peer_addr(), "discarding failed pooled connection");
            return;
        }
        // Deadlines belong to the borrower, not to the next one.
        conn.set_deadline(None);
        if let Err(err) = self.pool.put(conn) {
            debug!(error = %err, "pool rejected returned connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::sync::mpsc;

    /// Pool whose factory hands out one end of a fresh duplex pair and ships
    /// the other end to the test.
    fn duplex_pool(
        peers: mpsc::UnboundedSender<DuplexStream>,
    ) -> (Pool<Connection>, Arc<AtomicUsize>) {
        let dialed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dialed);
        let pool = Pool::builder()
            .ttl(Duration::from_secs(10))
            .factory(move || {
                let peers = peers.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let (local, remote) = duplex(4096);
                    peers.send(remote).map_err(|_| NetError::Closed)?;
                    Ok::<_, NetError>(Connection::from_stream(local))
                }
            })
            .build();
        (pool, dialed)
    }

    fn dead_connection() -> Connection {
        let (local, remote) = duplex(64);
        drop(remote);
        Connection::from_stream(local)
    }

    #[tokio::test]
    async fn reacquires_once_after_dead_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (pool, dialed) = duplex_pool(tx);
        let mut pooled = PooledConnection::new(pool.clone(), dead_connection());

        pooled.send(b"ping", None).await.unwrap();
        assert_eq!(pooled.health(), Health::Active);
        assert_eq!(dialed.load(Ordering::SeqCst), 1);

        let mut peer = rx.recv().await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn active_failure_surfaces_without_reacquire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (pool, dialed) = duplex_pool(tx);
        let mut pooled = PooledConnection::acquire(&pool).await.unwrap();
        let peer = rx.recv().await.unwrap();

        pooled.send(b"ok", None).await.unwrap();
        assert_eq!(pooled.health(), Health::Active);

        drop(peer);
        let err = pooled.recv(4, None).await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(pooled.health(), Health::Error);
        assert_eq!(dialed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_after_error_reacquires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (pool, dialed) = duplex_pool(tx);
        let mut pooled = PooledConnection::acquire(&pool).await.unwrap();
        let peer = rx.recv().await.unwrap();

        pooled.send(b"ok", None).await.unwrap();
        drop(peer);
        assert!(pooled.recv(4, None).await.is_err());
        assert_eq!(pooled.health(), Health::Error);
        assert_eq!(dialed.load(Ordering::SeqCst), 1);

        // The old peer is gone, so this write fails and runs again on a new
        // connection.
        pooled.send(b"again", None).await.unwrap();
        assert_eq!(pooled.health(), Health::Active);
        assert_eq!(dialed.load(Ordering::SeqCst), 2);

        let mut replacement = rx.recv().await.unwrap();
        let mut buf = [0u8; 5];
        replacement.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
    }

    #[tokio::test]
    async fn failed_reacquire_surfaces_pool_error() {
        let pool = Pool::new(Duration::from_secs(10));
        let mut pooled = PooledConnection::new(pool, dead_connection());

        let err = pooled.recv(1, None).await.unwrap_err();
        assert!(matches!(err.error(), NetError::PoolEmpty));
        assert_eq!(pooled.health(), Health::Error);
    }

    #[tokio::test]
    async fn drop_returns_healthy_connection() {
        let pool = Pool::new(Duration::from_secs(10));
        let (local, mut remote) = duplex(64);
        remote.write_all(b"hi").await.unwrap();

        let mut pooled = PooledConnection::new(pool.clone(), Connection::from_stream(local));
        assert_eq!(pooled.recv(2, None).await.unwrap(), b"hi");
        pooled.connection().unwrap().set_receive_deadline(Some(tokio::time::Instant::now()));
        drop(pooled);

        assert_eq!(pool.len(), 1);
        let conn = pool.get().await.unwrap();
        assert_eq!(conn.receive_deadline(), None);
    }

    #[tokio::test]
    async fn drop_discards_failed_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (pool, _) = duplex_pool(tx);
        let mut pooled = PooledConnection::acquire(&pool).await.unwrap();
        let peer = rx.recv().await.unwrap();

        pooled.send(b"ok", None).await.unwrap();
        drop(peer);
        assert!(pooled.recv(1, None).await.is_err());
        pooled.release();

        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn close_does_not_return_connection() {
        let pool = Pool::new(Duration::from_secs(10));
        let (local, mut remote) = duplex(64);
        let pooled = PooledConnection::new(pool.clone(), Connection::from_stream(local));

        pooled.close().await.unwrap();
        assert!(pool.is_empty());

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn frame_operations_recover_too() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (pool, _) = duplex_pool(tx);
        let mut pooled = PooledConnection::new(pool, dead_connection());

        let echo = tokio::spawn(async move {
            let peer = rx.recv().await.unwrap();
            let mut conn = Connection::from_stream(peer);
            let frame = conn.recv_pkg(FrameOption::new()).await.unwrap();
            conn.send_pkg(&frame, FrameOption::new()).await.unwrap();
        });

        let reply = pooled.send_recv_pkg(b"frame", FrameOption::new()).await.unwrap();
        assert_eq!(reply, b"frame");
        echo.await.unwrap();
    }
}
