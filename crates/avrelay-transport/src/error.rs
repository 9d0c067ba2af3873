//! Error types for the transport module.

use avrelay_types::LinkError;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid RTMP URL.
    #[error("Invalid RTMP URL: {0}")]
    InvalidUrl(String),

    /// TCP connect or RTMP handshake failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Server refused the connect, publish or play request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Server closed the connection.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Waiting for the server timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Stream content cannot be carried or understood.
    #[error("Unsupported stream: {0}")]
    Unsupported(String),

    /// RTMP protocol error.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// Not connected.
    #[error("Not connected")]
    NotConnected,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for LinkError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::InvalidUrl(msg) => LinkError::InvalidUrl(msg),
            TransportError::Connection(msg) => LinkError::Connect(msg),
            TransportError::Rejected(msg) => LinkError::Rejected(msg),
            TransportError::ConnectionLost(msg) => LinkError::Disconnected(msg),
            TransportError::Timeout(msg) => LinkError::Timeout(msg),
            TransportError::Unsupported(msg) | TransportError::Protocol(msg) => {
                LinkError::Protocol(msg)
            }
            TransportError::NotConnected => LinkError::NotOpen,
            TransportError::Io(e) => LinkError::Io(e),
        }
    }
}
