//! Append-only bytestream broker for a traffic-measurement platform.
//!
//! One storage daemon owns the on-disk layout (a directory per stream, one
//! file per segment) and mediates every producer and consumer operation
//! over a local datagram socket. The client stub in [`client`] exposes an
//! mmap-like open / map / commit / seek / close API and hides the protocol.

pub mod client;
pub mod clock;
pub mod error;
pub mod ipc;
pub mod mmap;
pub mod pool;
pub mod protocol;
pub mod record;
mod scheduler;
pub mod segment;
pub mod server;
pub mod stream;

pub use client::{StreamHandle, OPTIMAL_MAP_SIZE};
pub use clock::{Clock, QuantaClock, SystemClock};
pub use error::{Error, Result};
pub use protocol::{Mode, SeekDir};
pub use record::{RecordHeader, RECORD_HEADER_SIZE};
pub use server::{Server, ServerConfig, DEFAULT_CLIENT_TIMEOUT, MAX_CLIENTS};
