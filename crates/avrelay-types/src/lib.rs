//! Shared media model for avrelay.
//!
//! This crate defines the raw and compressed media units, the pipeline
//! configuration, the collaborator traits implemented by devices and
//! transports, and the events a running pipeline publishes.

mod config;
mod error;
mod events;
mod io;
mod media;
mod state;
mod time;

pub use config::{Direction, PipelineConfig, RetryPolicy};
pub use error::{ConfigError, ConversionError, DeviceError, LinkError, MediaError};
pub use events::{PipelineEvent, PipelineStats};
pub use io::{
    CaptureDevice, DeviceDirection, DeviceInfo, Incoming, PacketReader, PacketWriter,
    PlaybackDevice,
};
pub use media::{
    AudioFormat, CodecId, EncodedPacket, MediaFormat, MediaFrame, MediaKind, PixelFormat,
    SampleFormat, StreamInfo, VideoFormat,
};
pub use state::{ConnectionPhase, ConnectionState};
pub use time::TimeBase;

use crossbeam_channel::{Receiver, Sender};

/// Result type for media construction.
pub type MediaResult<T> = Result<T, MediaError>;

/// Result type for conversions.
pub type ConversionResult<T> = Result<T, ConversionError>;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Result type for network link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Delay between connection attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Upper bound on the retry delay when a backoff multiplier is configured.
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Relay buffer depth in batches.
pub const DEFAULT_BUFFER_UNITS: usize = 5;

/// Consumer wait bound in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Single source read timeout in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Source silence treated as a disconnect, in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;

/// Samples per audio batch, one AAC frame.
pub const DEFAULT_AUDIO_BATCH_UNITS: usize = 1024;

/// AAC bitrate in kbps.
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 128;

/// H.264 bitrate in kbps.
pub const DEFAULT_VIDEO_BITRATE_KBPS: u32 = 750;

/// Channel capacity for pipeline events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<PipelineEvent>, Receiver<PipelineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
