//! # tcpkit-common
//!
//! Purpose: Connection, framing and TLS primitives shared by the tcpkit client
//! and server crates.
//!
//! ## Design Principles
//! 1. **Deadline-Aware I/O**: Every blocking step honors the connection's
//!    receive or send deadline.
//! 2. **Buffered Cursor**: One buffered reader per connection, so bytes read
//!    past a delimiter stay available to the next call.
//! 3. **Typed Failures**: End of stream, timeouts and oversize frames are
//!    distinct error variants.

pub mod connection;
pub mod error;
pub mod frame;
pub mod retry;
pub mod tls;

pub use connection::{
    AsyncStream, Connection, DeadlineGuard, DEFAULT_BUFFER_WAIT, DEFAULT_CONNECT_TIMEOUT,
    READ_CHUNK_SIZE,
};
pub use error::{NetError, NetResult, RecvError, RecvResult};
pub use frame::{FrameOption, DEFAULT_HEADER_SIZE, MAX_DATA_SIZE_LIMIT, MAX_HEADER_SIZE};
pub use retry::{Retry, DEFAULT_RETRY_INTERVAL};
