//! # tcpkit-server
//!
//! Purpose: Host connection handlers behind a plain or TLS listener.
//!
//! ## Design Principles
//! 1. **Handler Owns the Connection**: Each accepted stream is wrapped as a
//!    `Connection` and moved into its handler task.
//! 2. **Named Sharing**: `ServerRegistry` lets independent components reach
//!    one server by name.

mod registry;
mod server;

pub use registry::{DEFAULT_SERVER_NAME, ServerRegistry};
pub use server::{ACCEPT_BACKOFF_LIMIT, ACCEPT_BACKOFF_START, Handler, Server};
