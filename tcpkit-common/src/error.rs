//! # Error Taxonomy
//!
//! Purpose: Give every layer of the toolkit one error vocabulary so callers can
//! tell terminal conditions (end of stream, protocol violations) apart from
//! recoverable ones (timeouts, transient I/O failures).
//!
//! ## Design Principles
//! 1. **Typed Kinds**: End-of-stream and deadline expiry are variants, not
//!    `io::ErrorKind` values to be sniffed at every call site.
//! 2. **Partial Data Travels With Errors**: Receive operations return
//!    [`RecvError`], which keeps whatever bytes arrived before the failure.
//! 3. **Fail Fast**: Configuration and protocol errors are raised before I/O.

use std::io;

use thiserror::Error;

/// Result type for send-side and configuration operations.
pub type NetResult<T> = Result<T, NetError>;

/// Result type for receive-family operations.
pub type RecvResult<T> = Result<T, RecvError>;

/// Errors surfaced by connections, frames, pools and servers.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed the stream. Never retried.
    #[error("connection closed by peer")]
    Closed,
    /// A receive or send deadline elapsed.
    #[error("operation timed out")]
    Timeout,
    /// Any other read/write failure; eligible for retry.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A frame length exceeds the configured maximum.
    #[error("data too long, data size {0}")]
    DataTooLong(usize),
    /// Frame header width or maximum payload size is out of range.
    #[error("invalid frame option: {0}")]
    InvalidOption(&'static str),
    /// The pool had no live entry and no factory to build one.
    #[error("pool and factory empty")]
    PoolEmpty,
    /// `put` was called on a closed pool.
    #[error("pool is closed")]
    PoolClosed,
    /// Address could not be resolved into a dial target or TLS server name.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// PEM file could not be read or parsed.
    #[error("pem error: {0}")]
    Pem(#[from] rustls_pki_types::pem::Error),
    /// Certificate file was readable but unusable.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

impl NetError {
    /// Returns true when the peer closed the stream.
    pub fn is_closed(&self) -> bool {
        matches!(self, NetError::Closed)
    }

    /// Returns true when a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }

    /// Maps raw I/O errors onto the taxonomy.
    ///
    /// `UnexpectedEof` and `TimedOut` become typed variants so retry logic can
    /// branch on them without inspecting kinds again.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => NetError::Closed,
            io::ErrorKind::TimedOut => NetError::Timeout,
            _ => NetError::Io(err),
        }
    }
}

/// Receive failure carrying the bytes gathered before it happened.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RecvError {
    data: Vec<u8>,
    #[source]
    source: NetError,
}

impl RecvError {
    /// Builds an error that keeps partially received data.
    pub fn new(data: Vec<u8>, source: NetError) -> Self {
        RecvError { data, source }
    }

    /// Bytes received before the failure (possibly empty).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Underlying error.
    pub fn error(&self) -> &NetError {
        &self.source
    }

    /// Splits into partial data and the underlying error.
    pub fn into_parts(self) -> (Vec<u8>, NetError) {
        (self.data, self.source)
    }

    /// Returns true when the peer closed the stream.
    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }

    /// Returns true when a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        self.source.is_timeout()
    }
}

impl From<NetError> for RecvError {
    fn from(source: NetError) -> Self {
        RecvError {
            data: Vec::new(),
            source,
        }
    }
}

impl From<io::Error> for RecvError {
    fn from(err: io::Error) -> Self {
        RecvError::from(NetError::from_io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_to_variants() {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(NetError::from_io(eof).is_closed());

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert!(NetError::from_io(timed_out).is_timeout());

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(NetError::from_io(reset), NetError::Io(_)));
    }

    #[test]
    fn recv_error_keeps_partial_data() {
        let err = RecvError::new(b"abc".to_vec(), NetError::Closed);
        assert_eq!(err.data(), b"abc");
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "connection closed by peer");

        let (data, source) = err.into_parts();
        assert_eq!(data, b"abc");
        assert!(source.is_closed());
    }

    #[test]
    fn data_too_long_message() {
        let err = NetError::DataTooLong(65536);
        assert_eq!(err.to_string(), "data too long, data size 65536");
    }
}
