//! RTMP transport.
//!
//! This crate provides the network ends of a relay: [`RtmpPublisher`] pushes
//! one encoded elementary stream to a server and [`RtmpPlayer`] pulls one
//! back. Both are synchronous links driving a private current-thread tokio
//! runtime, so the pipeline threads never see async code.

mod connection;
mod error;
pub mod flv;
pub mod nal;
mod player;
mod publisher;

pub use connection::{MediaMessage, RtmpConnection, RtmpUrl};
pub use error::TransportError;
pub use player::RtmpPlayer;
pub use publisher::{sequence_header, stream_metadata, RtmpPublisher};

use tokio::runtime::{Builder, Runtime};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Port used when the URL names none.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Socket read size.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Bound on each connect, handshake and request step in milliseconds.
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// How long a player waits for stream parameters after play starts.
pub const PROBE_TIMEOUT_MS: u64 = 1000;

/// Counters for one connection.
#[derive(Debug, Clone, Default)]
pub struct TransportStatistics {
    /// Media packets written or read.
    pub packets_sent: u64,

    /// Bytes written to the socket.
    pub bytes_sent: u64,

    /// Media packets received.
    pub packets_received: u64,
}

fn build_runtime() -> TransportResult<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}
