//! Relay pipeline engine for avrelay.
//!
//! This crate wires a source, a format converter, a codec session and a
//! sink into one pipeline, moves capture data through a bounded relay
//! buffer, and keeps the pipeline alive across transient failures.

mod context;
mod error;
mod metrics;
mod orchestrator;
mod relay_buffer;
mod sink;
mod source;
mod supervisor;

pub use context::{OpenPhase, PipelineContext};
pub use error::{BufferError, PipelineError, SinkError, SourceError};
pub use metrics::MetricsCollector;
pub use orchestrator::Pipeline;
pub use relay_buffer::RelayBuffer;
pub use sink::{DtsGuard, LocalPlaybackSink, NetworkPublishSink, Sink};
pub use source::{LocalCaptureSource, NetworkIngestSource, Source};
pub use supervisor::{sleep_cancellable, Supervisor};

use std::sync::Arc;

use avrelay_types::{event_channel, PipelineConfig, PipelineEvent, TimeBase};
use crossbeam_channel::Receiver;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type for source adapters.
pub type SourceResult<T> = Result<T, SourceError>;

/// Result type for sink adapters.
pub type SinkResult<T> = Result<T, SinkError>;

/// Result type for relay buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Interval between stats lines, in seconds.
pub const STATS_INTERVAL_SECS: u64 = 5;

/// A session streaming at least this long resets reconnect backoff.
pub const STABLE_SESSION_SECS: u64 = 10;

/// Granularity of cancellable waits, in milliseconds.
pub const RETRY_SLICE_MS: u64 = 50;

/// Time base of every packet handed to a publish sink.
pub const TRANSPORT_TIME_BASE: TimeBase = TimeBase::MILLIS;

/// Create a pipeline together with the receiving end of its event channel.
pub fn create_pipeline(
    config: impl Into<Arc<PipelineConfig>>,
    source: Source,
    sink: Sink,
) -> PipelineResult<(Pipeline, Receiver<PipelineEvent>)> {
    let (event_tx, event_rx) = event_channel();
    let pipeline = Pipeline::new(config, source, sink, event_tx)?;
    Ok((pipeline, event_rx))
}
