//! Error types for codec sessions.

use avrelay_types::MediaError;
use thiserror::Error;

/// Errors that can occur while building or driving a codec session.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Codec engine was not compiled into this build.
    #[error("Codec not available: {0}")]
    Unavailable(String),

    /// Codec cannot run with the requested parameters.
    #[error("Unsupported codec parameters: {0}")]
    Unsupported(String),

    /// Engine initialization failed.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Encoding a unit failed.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Decoding a unit failed.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Input does not match the session's format.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// Input sent after end of stream.
    #[error("Session already received end of stream")]
    Finished,

    /// Decoded output could not form a valid frame.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

impl CodecError {
    /// Returns true if rebuilding the session cannot help.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Unsupported(_))
    }

    /// Returns true if the error concerns a single unit, which the caller
    /// drops before carrying on.
    pub fn is_unit(&self) -> bool {
        matches!(
            self,
            Self::Encoding(_) | Self::Decoding(_) | Self::InvalidInput(_) | Self::Media(_)
        )
    }
}
