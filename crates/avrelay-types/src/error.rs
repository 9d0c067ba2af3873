//! Error types shared across the avrelay crates.

use thiserror::Error;

use crate::media::{MediaFormat, MediaKind};

/// Errors constructing media units.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Payload is not a whole number of units of the format.
    #[error("Payload of {actual} bytes does not match {format} (expected {expected} bytes)")]
    PayloadSize {
        format: MediaFormat,
        expected: usize,
        actual: usize,
    },

    /// Format has a zero dimension or rate.
    #[error("Incomplete media format: {0}")]
    IncompleteFormat(MediaFormat),
}

/// Errors produced by a format converter on a single unit.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// Input frame format differs from the bound input format.
    #[error("Format mismatch: converter bound to {expected}, got {actual}")]
    FormatMismatch {
        expected: MediaFormat,
        actual: MediaFormat,
    },

    /// Input and output media kinds differ.
    #[error("Cannot convert {from:?} to {to:?}")]
    KindMismatch { from: MediaKind, to: MediaKind },

    /// Requested parameter combination is not supported.
    #[error("Unsupported conversion: {0}")]
    Unsupported(String),

    /// Produced output could not form a valid frame.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Source and target formats carry different media kinds.
    #[error("Source is {source_kind:?} but target is {target_kind:?}")]
    KindMismatch {
        source_kind: MediaKind,
        target_kind: MediaKind,
    },

    /// Configured codec cannot carry the target media kind.
    #[error("Codec {codec} cannot carry {kind:?}")]
    CodecMismatch { codec: &'static str, kind: MediaKind },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from local capture and playback devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device matches the selector.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Device does not support the requested format.
    #[error("Unsupported device format: {0}")]
    Unsupported(String),

    /// Device is held by another process.
    #[error("Device busy: {0}")]
    Busy(String),

    /// Device went away while open.
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// Operation on a device that is not open.
    #[error("Device not open")]
    NotOpen,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("Device backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Returns true if retrying cannot help (bad selector or format).
    pub fn is_config(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unsupported(_))
    }
}

/// Errors from the network link behind a source or sink.
#[derive(Debug, Error)]
pub enum LinkError {
    /// URL could not be parsed or has the wrong scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// TCP connection or handshake failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Server rejected the publish or play request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Peer closed the connection.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation on a link that is not open.
    #[error("Link not open")]
    NotOpen,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Returns true if retrying cannot help.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::InvalidUrl(_))
    }
}
