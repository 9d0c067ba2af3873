//! Error types for the engine.

use std::time::Duration;

use avrelay_codec::CodecError;
use avrelay_types::{ConfigError, ConversionError, DeviceError, LinkError, MediaError};
use thiserror::Error;

/// Relay buffer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer was closed and holds too little to satisfy the request.
    #[error("Relay buffer closed")]
    Closed,

    /// A consume request that could never be satisfied.
    #[error("Request of {requested} bytes exceeds capacity {capacity}")]
    TooLarge { requested: usize, capacity: usize },
}

/// Errors raised by a source adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Local capture device failed.
    #[error("Capture device: {0}")]
    Device(#[from] DeviceError),

    /// Remote stream failed.
    #[error("Network ingest: {0}")]
    Link(#[from] LinkError),

    /// Nothing arrived for longer than the idle timeout.
    #[error("Source idle for {0:?}")]
    Idle(Duration),

    /// The source has no more data.
    #[error("Source ended")]
    EndOfStream,

    /// Operation on a source that is not open.
    #[error("Source not open")]
    NotOpen,
}

impl SourceError {
    /// Returns true if reopening cannot help.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Device(e) => e.is_config(),
            Self::Link(e) => e.is_config(),
            _ => false,
        }
    }
}

/// Errors raised by a sink adapter.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Local playback device failed.
    #[error("Playback device: {0}")]
    Device(#[from] DeviceError),

    /// Remote publish failed.
    #[error("Network publish: {0}")]
    Link(#[from] LinkError),

    /// Operation on a sink that is not open.
    #[error("Sink not open")]
    NotOpen,
}

impl SinkError {
    /// Returns true if reopening cannot help.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Device(e) => e.is_config(),
            Self::Link(e) => e.is_config(),
            Self::NotOpen => false,
        }
    }
}

/// Errors that end a pipeline session.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Codec failure that is not confined to one unit.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Converter could not be built for the negotiated formats.
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Frame construction failed.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Source failure.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Sink failure.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Relay buffer misuse.
    #[error("Relay buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// A session thread could not be started or panicked.
    #[error("Thread error: {0}")]
    Thread(String),
}

impl PipelineError {
    /// Returns true if the error is fatal at startup and must not be retried.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) | Self::Conversion(_) => true,
            Self::Codec(e) => e.is_config(),
            Self::Source(e) => e.is_config(),
            Self::Sink(e) => e.is_config(),
            Self::Media(_) | Self::Buffer(_) | Self::Thread(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let bad_device = PipelineError::from(SourceError::from(DeviceError::NotFound("hw:9".into())));
        assert!(bad_device.is_config());

        let busy = PipelineError::from(SourceError::from(DeviceError::Busy("hw:0".into())));
        assert!(!busy.is_config());

        let bad_url = PipelineError::from(SinkError::from(LinkError::InvalidUrl("x".into())));
        assert!(bad_url.is_config());

        let refused = PipelineError::from(SinkError::from(LinkError::Connect("refused".into())));
        assert!(!refused.is_config());

        let missing = PipelineError::from(CodecError::Unavailable("aac".into()));
        assert!(missing.is_config());

        assert!(!PipelineError::from(SourceError::EndOfStream).is_config());
    }
}
