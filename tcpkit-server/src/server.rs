//! # TCP Server
//!
//! Purpose: Accept plain or TLS connections and run a user handler on each,
//! one task per connection.
//!
//! ## Design Principles
//! 1. **Task Per Connection**: The accept loop never waits on a handler.
//! 2. **Keep Accepting**: Handshake failures are logged per connection.
//!    Accept failures back off exponentially and only stop the loop once the
//!    pause passes [`ACCEPT_BACKOFF_LIMIT`].
//! 3. **Cooperative Close**: `close` cancels the loop and drops the listener,
//!    and may be called from any task.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rustls::ServerConfig;
use tcpkit_common::{Connection, NetError, NetResult, tls};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First pause after a failed accept; doubles per consecutive failure.
pub const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);

/// `run` returns the accept error once the next pause would exceed this.
pub const ACCEPT_BACKOFF_LIMIT: Duration = Duration::from_secs(5);

/// Per-connection handler; owns the connection for its lifetime.
pub type Handler = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Listening server bound to one address.
pub struct Server {
    address: String,
    handler: Handler,
    tls: Option<TlsAcceptor>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("local_addr", &*self.local_addr.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Server {
    /// Plain TCP server; nothing is bound until [`Server::bind`] or
    /// [`Server::run`].
    pub fn new<F, Fut>(address: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Server {
            address: address.into(),
            handler: Arc::new(move |conn: Connection| -> BoxFuture<'static, ()> {
                Box::pin(handler(conn))
            }),
            tls: None,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// TLS server using a prepared rustls configuration.
    pub fn with_tls<F, Fut>(
        address: impl Into<String>,
        config: Arc<ServerConfig>,
        handler: F,
    ) -> Self
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut server = Server::new(address, handler);
        server.tls = Some(TlsAcceptor::from(config));
        server
    }

    /// TLS server loading its certificate chain and key from PEM files.
    pub fn with_key_crt<F, Fut>(
        address: impl Into<String>,
        crt_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        handler: F,
    ) -> NetResult<Self>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = tls::load_server_config(crt_file, key_file)?;
        Ok(Server::with_tls(address, config, handler))
    }

    /// Configured listen address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address actually bound, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Whether connections go through a TLS handshake.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether [`Server::close`] ran, or `run` gave up on accept errors.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Binds the listener now and returns the bound address.
    ///
    /// Port 0 picks a free port. Binding twice returns the first address.
    pub async fn bind(&self) -> NetResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(NetError::from_io)?;
        let addr = listener.local_addr().map_err(NetError::from_io)?;

        let mut slot = self.listener.lock();
        let mut bound = self.local_addr.lock();
        if let Some(existing) = *bound {
            return Ok(existing);
        }
        *slot = Some(listener);
        *bound = Some(addr);
        info!(%addr, tls = self.is_tls(), "server listening");
        Ok(addr)
    }

    /// Accepts connections until [`Server::close`] is called.
    ///
    /// Failed accepts are retried after a doubling pause; once the pause would
    /// pass [`ACCEPT_BACKOFF_LIMIT`] the accept error is returned.
    pub async fn run(&self) -> NetResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.bind().await?;
        let Some(listener) = self.listener.lock().take() else {
            // Another `run` owns the listener, or `close` dropped it.
            return Ok(());
        };

        let mut backoff = AcceptBackoff::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        debug!(%peer, "connection accepted");
                        self.spawn_connection(stream, peer);
                    }
                    Err(err) => {
                        let Some(pause) = backoff.failed() else {
                            error!(error = %err, "accept keeps failing, stopping server");
                            self.shutdown.cancel();
                            return Err(NetError::from_io(err));
                        };
                        error!(error = %err, ?pause, "accept failed");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                },
            }
        }

        info!(address = %self.address, "server stopped");
        Ok(())
    }

    /// Stops the accept loop and releases the listener. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.listener.lock().take();
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let handler = Arc::clone(&self.handler);
        let acceptor = self.tls.clone();
        tokio::spawn(async move {
            let conn = match acceptor {
                None => Connection::from_tcp(stream),
                Some(acceptor) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, error = %err, "failed to disable nagle");
                    }
                    let local = stream.local_addr().ok();
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            Connection::from_stream(tls_stream).with_addrs(Some(peer), local)
                        }
                        Err(err) => {
                            warn!(%peer, error = %err, "tls handshake failed");
                            return;
                        }
                    }
                }
            };
            handler(conn).await;
            debug!(%peer, "connection handler finished");
        });
    }
}

/// Doubling pause between failed accepts.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        AcceptBackoff { next: ACCEPT_BACKOFF_START }
    }

    /// Pause before the next accept, or `None` once the limit is passed.
    fn failed(&mut self) -> Option<Duration> {
        if self.next > ACCEPT_BACKOFF_LIMIT {
            return None;
        }
        let pause = self.next;
        self.next = self.next.saturating_mul(2);
        Some(pause)
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_START;
    }
}
