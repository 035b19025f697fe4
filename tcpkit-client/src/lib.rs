//! # tcpkit-client
//!
//! Purpose: Reuse TCP connections across requests through TTL pools and
//! recover transparently from connections that went stale while idle.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections to avoid repeated dials and
//!    handshakes.
//! 2. **Lazy + Periodic Expiry**: Idle connections expire on access and in a
//!    once-per-second background sweep.
//! 3. **Single Owner**: A checked-out connection is used through `&mut self`,
//!    so concurrent use needs explicit synchronization by the caller.

mod manager;
mod pool;
mod pooled;
mod queue;

pub use manager::{DEFAULT_POOL_TTL, PoolConfig, PoolManager};
pub use pool::{Disposer, Factory, Pool, PoolBuilder, SWEEP_INTERVAL};
pub use pooled::{Health, PooledConnection};
pub use queue::EntryQueue;
