//! # Connection
//!
//! Purpose: Wrap a duplex byte stream (plain TCP, TLS, or an in-memory pipe)
//! with deadlines, buffered reads, and three receive termination policies.
//!
//! ## Design Principles
//! 1. **Deadlines, Not Tokens**: Every read/write is bounded by an absolute
//!    `Instant`; expiry surfaces as [`NetError::Timeout`].
//! 2. **No Lost Bytes**: Reads go through a `BufReader` and only cancel-safe
//!    read futures, so a read that loses against its deadline drops nothing.
//! 3. **Partial Data Is Returned**: Receive failures carry the bytes gathered
//!    so far inside [`RecvError`].
//! 4. **Scoped Restoration**: Time-boxed calls restore the previous deadline
//!    through a guard, even when the future is dropped mid-flight.
//!
//! ## Receive Modes
//!
//! | Call             | Terminates when                                   |
//! |------------------|---------------------------------------------------|
//! | `recv(n > 0)`    | exactly `n` bytes arrived                         |
//! | `recv(0)`        | data arrived, then none within the buffer wait    |
//! | `recv_til(d)`    | the received bytes end with `d` (ASCII-insensitive) |
//! | `recv_line()`    | a `\n` arrives; the terminator is stripped        |
//! | `recv_some()`    | the first read returns anything                   |

use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{NetError, NetResult, RecvError, RecvResult};
use crate::retry::Retry;
use crate::tls;

/// Dial timeout used when the caller does not pick one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a drain-available receive waits for more bytes.
pub const DEFAULT_BUFFER_WAIT: Duration = Duration::from_millis(1);

/// Growth step for receives without a target length.
pub const READ_CHUNK_SIZE: usize = 128;

/// Any stream a [`Connection`] can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Deadline-aware, buffered byte-stream connection.
///
/// A connection is used by one caller at a time; every operation takes
/// `&mut self` and runs strictly after the previous one.
pub struct Connection {
    // Buffered reader doubles as the write half via `get_mut`.
    reader: BufReader<Box<dyn AsyncStream>>,
    receive_deadline: Option<Instant>,
    send_deadline: Option<Instant>,
    buffer_wait: Duration,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("receive_deadline", &self.receive_deadline)
            .field("send_deadline", &self.send_deadline)
            .field("buffer_wait", &self.buffer_wait)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Construction
// ============================================================================

impl Connection {
    /// Dials `addr` with the default 30s connect timeout.
    pub async fn connect(addr: &str) -> NetResult<Self> {
        Self::connect_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Dials `addr`, giving up after `dial_timeout`.
    pub async fn connect_timeout(addr: &str, dial_timeout: Duration) -> NetResult<Self> {
        let stream = match timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(NetError::from_io(err)),
            Err(_) => return Err(NetError::Timeout),
        };
        debug!(addr, "tcp connection established");
        Ok(Self::from_tcp(stream))
    }

    /// Dials `addr` and performs a TLS handshake with `config`.
    ///
    /// The host part of `addr` is used as the TLS server name.
    pub async fn connect_tls(addr: &str, config: Arc<ClientConfig>) -> NetResult<Self> {
        Self::connect_tls_timeout(addr, config, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Like [`Connection::connect_tls`], bounding dial plus handshake.
    pub async fn connect_tls_timeout(
        addr: &str,
        config: Arc<ClientConfig>,
        dial_timeout: Duration,
    ) -> NetResult<Self> {
        let server_name = tls::server_name(addr)?;
        let connector = TlsConnector::from(config);
        let handshake = async move {
            let stream = TcpStream::connect(addr).await?;
            // Disable Nagle to keep request latency low for small payloads.
            stream.set_nodelay(true)?;
            let peer_addr = stream.peer_addr().ok();
            let local_addr = stream.local_addr().ok();
            let stream = connector.connect(server_name, stream).await?;
            Ok::<_, std::io::Error>((stream, peer_addr, local_addr))
        };

        let (stream, peer_addr, local_addr) = match timeout(dial_timeout, handshake).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => return Err(NetError::from_io(err)),
            Err(_) => return Err(NetError::Timeout),
        };
        debug!(addr, "tls connection established");

        Ok(Self::from_stream(stream).with_addrs(peer_addr, local_addr))
    }

    /// Dials `addr` over TLS using a PEM certificate/key pair from disk.
    pub async fn connect_key_crt(
        addr: &str,
        crt_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> NetResult<Self> {
        let config = tls::load_client_config(crt_file, key_file)?;
        Self::connect_tls(addr, config).await
    }

    /// Wraps an accepted or dialed TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "failed to disable nagle");
        }
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        Self::from_stream(stream).with_addrs(peer_addr, local_addr)
    }

    /// Wraps any duplex stream, e.g. a TLS stream or `tokio::io::duplex`.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncStream + 'static,
    {
        let stream: Box<dyn AsyncStream> = Box::new(stream);
        Connection {
            reader: BufReader::new(stream),
            receive_deadline: None,
            send_deadline: None,
            buffer_wait: DEFAULT_BUFFER_WAIT,
            peer_addr: None,
            local_addr: None,
        }
    }

    /// Records socket addresses for a stream wrapped with
    /// [`Connection::from_stream`], such as an accepted TLS stream.
    pub fn with_addrs(
        mut self,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        self.peer_addr = peer_addr;
        self.local_addr = local_addr;
        self
    }

    /// Remote address, when the stream is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address, when the stream is a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of bytes read from the stream but not yet returned.
    pub fn buffered(&self) -> usize {
        self.reader.buffer().len()
    }

    /// Shuts down the write half of the stream.
    pub async fn shutdown(&mut self) -> NetResult<()> {
        self.reader
            .get_mut()
            .shutdown()
            .await
            .map_err(NetError::from_io)
    }
}

// ============================================================================
// Deadlines
// ============================================================================

impl Connection {
    /// Sets both the receive and send deadline. `None` clears them.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.receive_deadline = deadline;
        self.send_deadline = deadline;
    }

    /// Sets the deadline applied to every subsequent read.
    pub fn set_receive_deadline(&mut self, deadline: Option<Instant>) {
        self.receive_deadline = deadline;
    }

    /// Sets the deadline applied to every subsequent write.
    pub fn set_send_deadline(&mut self, deadline: Option<Instant>) {
        self.send_deadline = deadline;
    }

    /// Currently applied receive deadline.
    pub fn receive_deadline(&self) -> Option<Instant> {
        self.receive_deadline
    }

    /// Currently applied send deadline.
    pub fn send_deadline(&self) -> Option<Instant> {
        self.send_deadline
    }

    /// Sets how long a drain-available receive waits for more bytes.
    ///
    /// Keep it short: every drain receive pays it once at the end.
    pub fn set_receive_buffer_wait(&mut self, wait: Duration) {
        self.buffer_wait = wait;
    }

    /// Current buffer wait.
    pub fn receive_buffer_wait(&self) -> Duration {
        self.buffer_wait
    }

    /// Applies a receive deadline of now + `timeout` until the guard drops.
    ///
    /// The guard derefs to the connection and restores the previous receive
    /// deadline on drop.
    pub fn scoped_receive_deadline(&mut self, timeout: Duration) -> DeadlineGuard<'_> {
        DeadlineGuard::new(self, DeadlineKind::Receive, timeout)
    }

    /// Applies a send deadline of now + `timeout` until the guard drops.
    pub fn scoped_send_deadline(&mut self, timeout: Duration) -> DeadlineGuard<'_> {
        DeadlineGuard::new(self, DeadlineKind::Send, timeout)
    }

    fn buffer_wait_deadline(&self) -> Instant {
        let wait = Instant::now() + self.buffer_wait;
        match self.receive_deadline {
            Some(deadline) if deadline < wait => deadline,
            _ => wait,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DeadlineKind {
    Receive,
    Send,
}

/// Scope guard restoring a connection deadline on drop.
#[derive(Debug)]
pub struct DeadlineGuard<'a> {
    conn: &'a mut Connection,
    kind: DeadlineKind,
    previous: Option<Instant>,
}

impl<'a> DeadlineGuard<'a> {
    fn new(conn: &'a mut Connection, kind: DeadlineKind, timeout: Duration) -> Self {
        // An unrepresentable instant means "effectively never".
        let deadline = Instant::now().checked_add(timeout);
        let previous = match kind {
            DeadlineKind::Receive => std::mem::replace(&mut conn.receive_deadline, deadline),
            DeadlineKind::Send => std::mem::replace(&mut conn.send_deadline, deadline),
        };
        DeadlineGuard {
            conn,
            kind,
            previous,
        }
    }
}

impl Deref for DeadlineGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for DeadlineGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        match self.kind {
            DeadlineKind::Receive => self.conn.receive_deadline = self.previous,
            DeadlineKind::Send => self.conn.send_deadline = self.previous,
        }
    }
}

// ============================================================================
// Send
// ============================================================================

impl Connection {
    /// Writes the whole buffer, retrying recoverable failures per `retry`.
    pub async fn send(&mut self, data: &[u8], retry: Option<Retry>) -> NetResult<()> {
        let mut retry = retry;
        loop {
            match self.write_all(data).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if err.is_closed() || !Retry::backoff(&mut retry).await {
                        return Err(err);
                    }
                    debug!(error = %err, "send failed, retrying");
                }
            }
        }
    }

    /// Sends under a send deadline of now + `timeout`.
    pub async fn send_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        retry: Option<Retry>,
    ) -> NetResult<()> {
        let mut conn = self.scoped_send_deadline(timeout);
        conn.send(data, retry).await
    }

    /// Sends `data`, then receives `length` bytes (see [`Connection::recv`]).
    pub async fn send_recv(
        &mut self,
        data: &[u8],
        length: usize,
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        self.send(data, retry).await?;
        self.recv(length, retry).await
    }

    /// Sends `data`, then receives under a receive deadline of now + `timeout`.
    pub async fn send_recv_with_timeout(
        &mut self,
        data: &[u8],
        length: usize,
        timeout: Duration,
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        self.send(data, retry).await?;
        self.recv_with_timeout(length, timeout, retry).await
    }

    async fn write_all(&mut self, data: &[u8]) -> NetResult<()> {
        let deadline = self.send_deadline;
        let stream = self.reader.get_mut();
        let write = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        let result = match deadline {
            Some(deadline) => match timeout_at(deadline, write).await {
                Ok(result) => result,
                Err(_) => return Err(NetError::Timeout),
            },
            None => write.await,
        };
        result.map_err(NetError::from_io)
    }
}

// ============================================================================
// Receive
// ============================================================================

impl Connection {
    /// Receives data according to `length`.
    ///
    /// `length > 0` fills exactly `length` bytes; `length == 0` drains
    /// whatever is currently available (see [`Connection::recv_available`]).
    pub async fn recv(&mut self, length: usize, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        if length > 0 {
            let mut retry = retry;
            self.recv_exact(length, &mut retry).await
        } else {
            self.recv_available(retry).await
        }
    }

    /// Receives under a receive deadline of now + `timeout`.
    pub async fn recv_with_timeout(
        &mut self,
        length: usize,
        timeout: Duration,
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        let mut conn = self.scoped_receive_deadline(timeout);
        conn.recv(length, retry).await
    }

    /// Returns every byte that arrives before the stream goes quiet.
    ///
    /// The first read waits under the receive deadline, and a timeout there is
    /// reported as [`NetError::Timeout`]. Once something has arrived, each
    /// further read waits at most the buffer wait (or the receive deadline, if
    /// sooner) and a timeout ends the call with what was gathered. End of
    /// stream is an error carrying the partial data.
    pub async fn recv_available(&mut self, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        let mut retry = retry;
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let mut filled = 0;
        loop {
            if filled == buffer.len() {
                buffer.resize(buffer.len() + READ_CHUNK_SIZE, 0);
            }
            let deadline = if filled == 0 {
                self.receive_deadline
            } else {
                Some(self.buffer_wait_deadline())
            };
            match self.read_some(&mut buffer[filled..], deadline).await {
                Ok(size) => filled += size,
                Err(NetError::Timeout) if filled > 0 => break,
                Err(err) => {
                    if err.is_closed() || !Retry::backoff(&mut retry).await {
                        buffer.truncate(filled);
                        return Err(RecvError::new(buffer, err));
                    }
                    debug!(error = %err, "receive failed, retrying");
                }
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Performs a single read of up to [`READ_CHUNK_SIZE`] bytes.
    ///
    /// Blocks until something arrives or the receive deadline passes.
    pub async fn recv_some(&mut self, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        let mut retry = retry;
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let deadline = self.receive_deadline;
            match self.read_some(&mut buffer, deadline).await {
                Ok(size) => {
                    buffer.truncate(size);
                    return Ok(buffer);
                }
                Err(err) => {
                    if err.is_closed() || !Retry::backoff(&mut retry).await {
                        return Err(RecvError::from(err));
                    }
                    debug!(error = %err, "receive failed, retrying");
                }
            }
        }
    }

    /// Receives until the data ends with `delimiter`, which is included.
    ///
    /// Matching ignores ASCII case. An empty delimiter never matches, so the
    /// call then reads until an error. One retry budget covers the whole call.
    pub async fn recv_til(
        &mut self,
        delimiter: &[u8],
        retry: Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        let mut retry = retry;
        let mut data = Vec::new();
        loop {
            match self.recv_exact(1, &mut retry).await {
                Ok(byte) => {
                    data.extend_from_slice(&byte);
                    if ends_with_ignore_case(&data, delimiter) {
                        return Ok(data);
                    }
                }
                Err(err) => {
                    let (_, source) = err.into_parts();
                    return Err(RecvError::new(data, source));
                }
            }
        }
    }

    /// Receives one line; the `\n` (and a preceding `\r`) is stripped.
    pub async fn recv_line(&mut self, retry: Option<Retry>) -> RecvResult<Vec<u8>> {
        let mut line = self.recv_til(b"\n", retry).await?;
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Fills exactly `length` bytes, sharing `retry` with the caller.
    pub(crate) async fn recv_exact(
        &mut self,
        length: usize,
        retry: &mut Option<Retry>,
    ) -> RecvResult<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let deadline = self.receive_deadline;
            match self.read_some(&mut buffer[filled..], deadline).await {
                Ok(size) => filled += size,
                Err(err) => {
                    if err.is_closed() || !Retry::backoff(retry).await {
                        buffer.truncate(filled);
                        return Err(RecvError::new(buffer, err));
                    }
                    debug!(error = %err, "receive failed, retrying");
                }
            }
        }
        Ok(buffer)
    }

    /// One read bounded by `deadline`; zero bytes means end of stream.
    async fn read_some(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> NetResult<usize> {
        let read = self.reader.read(buf);
        let result = match deadline {
            Some(deadline) => match timeout_at(deadline, read).await {
                Ok(result) => result,
                Err(_) => return Err(NetError::Timeout),
            },
            None => read.await,
        };
        match result {
            Ok(0) => Err(NetError::Closed),
            Ok(size) => Ok(size),
            Err(err) => Err(NetError::from_io(err)),
        }
    }
}

fn ends_with_ignore_case(data: &[u8], suffix: &[u8]) -> bool {
    !suffix.is_empty()
        && data.len() >= suffix.len()
        && data[data.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}
