//! # Frame Protocol
//!
//! Purpose: Length-prefixed framing over a [`Connection`], with a header of
//! 1 to 4 bytes negotiated out of band between peers.
//!
//! ## Design Principles
//!
//! 1. **Validate Before I/O**: Option and length checks run before any byte
//!    is written or any payload byte is read.
//! 2. **One Write Per Frame**: Header and payload leave in a single send so a
//!    retry never splits them.
//! 3. **Big-Endian Tail**: The header is the trailing `header_size` bytes of
//!    a big-endian `u32`, so narrower headers just drop leading zeros.
//!
//! ## Wire Layout Example
//!
//! ```text
//! header_size = 2, payload = "hello":
//! +------------+-------------------+
//! | 0x00 0x05  | h  e  l  l  o     |
//! +------------+-------------------+
//! | len:2B     | payload:5B        |
//! +------------+-------------------+
//!
//! header_size = 3, payload of 70000 bytes:
//! +----------------+----------------+
//! | 0x01 0x11 0x70 | payload:70000B |
//! +----------------+----------------+
//! ```
//!
//! | Header width | Default max payload |
//! |--------------|---------------------|
//! | 1            | 0xFF                |
//! | 2 (default)  | 0xFFFF              |
//! | 3            | 0xFFFFFF            |
//! | 4            | 0x7FFFFFFF          |

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::{NetError, NetResult, RecvError, RecvResult};
use crate::retry::Retry;

/// Header width used when an option leaves it at zero.
pub const DEFAULT_HEADER_SIZE: usize = 2;

/// Widest supported header.
pub const MAX_HEADER_SIZE: usize = 4;

/// Hard ceiling for any configured maximum payload size.
pub const MAX_DATA_SIZE_LIMIT: usize = 0x7FFF_FFFF;

/// Framing parameters; both peers must agree on them.
///
/// Zero fields select defaults: header width 2 and the width's natural
/// maximum payload size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOption {
    /// Header width in bytes (1..=4, 0 = default).
    pub header_size: usize,
    /// Largest accepted payload (0 = derived from the header width).
    pub max_data_size: usize,
    /// Retry policy applied to the frame's send or receives.
    pub retry: Retry,
}

impl FrameOption {
    /// Default option: 2-byte header, 65535-byte payloads, no retry.
    pub fn new() -> Self {
        FrameOption::default()
    }

    /// Sets the header width.
    pub fn with_header_size(mut self, header_size: usize) -> Self {
        self.header_size = header_size;
        self
    }

    /// Sets the maximum payload size.
    pub fn with_max_data_size(mut self, max_data_size: usize) -> Self {
        self.max_data_size = max_data_size;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Fills in defaults and validates the ranges.
    pub fn resolve(&self) -> NetResult<FrameOption> {
        let header_size = match self.header_size {
            0 => DEFAULT_HEADER_SIZE,
            size if size > MAX_HEADER_SIZE => {
                return Err(NetError::InvalidOption("header size is too big"));
            }
            size => size,
        };
        let max_data_size = match self.max_data_size {
            0 => default_max_data_size(header_size),
            size if size > MAX_DATA_SIZE_LIMIT => {
                return Err(NetError::InvalidOption("max data size is too big"));
            }
            size => size,
        };
        Ok(FrameOption {
            header_size,
            max_data_size,
            retry: self.retry,
        })
    }

    /// Retry policy, only when it actually allows another attempt.
    fn retry_policy(&self) -> Option<Retry> {
        self.retry.has_remaining().then_some(self.retry)
    }
}

fn default_max_data_size(header_size: usize) -> usize {
    match header_size {
        1 => 0xFF,
        2 => 0xFFFF,
        3 => 0xFF_FFFF,
        _ => MAX_DATA_SIZE_LIMIT,
    }
}

/// Encodes `data` as one frame (header followed by payload).
pub fn encode_frame(data: &[u8], option: &FrameOption) -> NetResult<Bytes> {
    let option = option.resolve()?;
    if data.len() > option.max_data_size {
        return Err(NetError::DataTooLong(data.len()));
    }

    let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE + data.len());
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    // Keep only the trailing `header_size` bytes of the length word.
    buf.advance(MAX_HEADER_SIZE - option.header_size);
    Ok(buf.freeze())
}

/// Decodes a received header into the payload length.
///
/// The bytes are the low-order bytes of a big-endian `u32`.
pub fn decode_header(header: &[u8]) -> NetResult<usize> {
    if header.is_empty() || header.len() > MAX_HEADER_SIZE {
        return Err(NetError::InvalidOption("header size out of range"));
    }
    let mut word = [0u8; MAX_HEADER_SIZE];
    word[MAX_HEADER_SIZE - header.len()..].copy_from_slice(header);
    Ok(u32::from_be_bytes(word) as usize)
}

impl Connection {
    /// Sends `data` as a single frame.
    ///
    /// Oversized payloads fail with [`NetError::DataTooLong`] and nothing is
    /// written.
    pub async fn send_pkg(&mut self, data: &[u8], option: FrameOption) -> NetResult<()> {
        let frame = encode_frame(data, &option)?;
        self.send(&frame, option.retry_policy()).await
    }

    /// Receives one frame and returns its payload.
    ///
    /// A declared length above the maximum fails with
    /// [`NetError::DataTooLong`] before any payload byte is read.
    pub async fn recv_pkg(&mut self, option: FrameOption) -> RecvResult<Vec<u8>> {
        let option = option.resolve()?;

        let mut retry = option.retry_policy();
        let header = match self.recv_exact(option.header_size, &mut retry).await {
            Ok(header) => header,
            // A torn header is not payload; report the error alone.
            Err(err) => return Err(RecvError::from(err.into_parts().1)),
        };

        let length = decode_header(&header)?;
        if length > option.max_data_size {
            return Err(NetError::DataTooLong(length).into());
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut retry = option.retry_policy();
        self.recv_exact(length, &mut retry).await
    }

    /// Sends a frame under a send deadline of now + `timeout`.
    pub async fn send_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        option: FrameOption,
    ) -> NetResult<()> {
        let mut conn = self.scoped_send_deadline(timeout);
        conn.send_pkg(data, option).await
    }

    /// Receives a frame under a receive deadline of now + `timeout`.
    pub async fn recv_pkg_with_timeout(
        &mut self,
        timeout: Duration,
        option: FrameOption,
    ) -> RecvResult<Vec<u8>> {
        let mut conn = self.scoped_receive_deadline(timeout);
        conn.recv_pkg(option).await
    }

    /// Sends a frame and waits for the reply frame.
    pub async fn send_recv_pkg(&mut self, data: &[u8], option: FrameOption) -> RecvResult<Vec<u8>> {
        self.send_pkg(data, option).await?;
        self.recv_pkg(option).await
    }

    /// Sends a frame and waits for the reply under now + `timeout`.
    pub async fn send_recv_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        option: FrameOption,
    ) -> RecvResult<Vec<u8>> {
        self.send_pkg(data, option).await?;
        self.recv_pkg_with_timeout(timeout, option).await
    }
}
