//! Stage handles of one pipeline and their phased startup.

use std::sync::Arc;

use avrelay_codec::{
    create_decoder, create_encoder, DecoderConfig, DecoderSession, EncoderConfig, EncoderSession,
};
use avrelay_convert::FrameConverter;
use avrelay_types::{Direction, MediaFormat, PipelineConfig, StreamInfo};
use tracing::{debug, info, instrument};

use crate::error::{SinkError, SourceError};
use crate::relay_buffer::RelayBuffer;
use crate::sink::Sink;
use crate::source::Source;
use crate::PipelineResult;

/// Startup phases, opened in order and rolled back in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPhase {
    Source,
    Codec,
    Converter,
    Sink,
}

impl OpenPhase {
    /// First phase.
    pub const FIRST: Self = Self::Source;

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Source => Some(Self::Codec),
            Self::Codec => Some(Self::Converter),
            Self::Converter => Some(Self::Sink),
            Self::Sink => None,
        }
    }

    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Source => None,
            Self::Codec => Some(Self::Source),
            Self::Converter => Some(Self::Codec),
            Self::Sink => Some(Self::Converter),
        }
    }
}

/// Every stage handle of a pipeline.
///
/// Owned by the orchestrator and lent to the supervisor by `&mut`. The
/// configuration is shared, never copied, so every reconnection sees the
/// same `Arc`.
pub struct PipelineContext {
    config: Arc<PipelineConfig>,
    pub(crate) source: Source,
    pub(crate) sink: Sink,
    pub(crate) encoder: Option<Box<dyn EncoderSession>>,
    pub(crate) decoder: Option<Box<dyn DecoderSession>>,
    pub(crate) converter: Option<FrameConverter>,
    pub(crate) buffer: Option<Arc<RelayBuffer>>,
    /// Format delivered by the capture device in the current session.
    pub(crate) source_format: Option<MediaFormat>,
    ingest_stream: Option<StreamInfo>,
    /// Last phase that was (at least partly) opened.
    phase: Option<OpenPhase>,
}

impl PipelineContext {
    pub fn new(config: Arc<PipelineConfig>, source: Source, sink: Sink) -> Self {
        Self {
            config,
            source,
            sink,
            encoder: None,
            decoder: None,
            converter: None,
            buffer: None,
            source_format: None,
            ingest_stream: None,
            phase: None,
        }
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// Returns true if any stage holds resources.
    pub fn is_open(&self) -> bool {
        self.phase.is_some()
    }

    /// Returns true once every phase has opened.
    pub fn is_ready(&self) -> bool {
        self.phase == Some(OpenPhase::Sink)
    }

    /// Relay buffer of the current session.
    pub fn buffer(&self) -> Option<&Arc<RelayBuffer>> {
        self.buffer.as_ref()
    }

    /// Bytes per relay buffer unit for the negotiated capture format.
    pub fn batch_bytes(&self) -> usize {
        self.source_format
            .map(|f| f.byte_size(self.config.batch_units))
            .unwrap_or(0)
    }

    /// Open every stage in phase order. On failure the phases opened so far
    /// are closed again before the error is returned.
    #[instrument(name = "open_pipeline", skip(self), fields(direction = self.config.direction.name()))]
    pub fn open_all(&mut self) -> PipelineResult<()> {
        self.close_all();

        let mut phase = OpenPhase::FIRST;
        loop {
            self.phase = Some(phase);
            if let Err(e) = self.open_phase(phase) {
                debug!(?phase, "Phase failed: {}", e);
                self.close_all();
                return Err(e);
            }
            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        info!(source = self.source.name(), sink = self.sink.name(), "Pipeline open");
        Ok(())
    }

    fn open_phase(&mut self, phase: OpenPhase) -> PipelineResult<()> {
        debug!(?phase, "Opening phase");
        match (self.config.direction, phase) {
            (Direction::Publish, OpenPhase::Source) => {
                let capture = self.source.as_capture_mut().ok_or(SourceError::NotOpen)?;
                self.source_format = Some(capture.open(&self.config)?);
            }
            (Direction::Play, OpenPhase::Source) => {
                let ingest = self.source.as_ingest_mut().ok_or(SourceError::NotOpen)?;
                self.ingest_stream = Some(ingest.open(&self.config)?);
            }
            (Direction::Publish, OpenPhase::Codec) => {
                let encoder = create_encoder(&EncoderConfig::from_pipeline(&self.config))?;
                self.encoder = Some(encoder);
            }
            (Direction::Play, OpenPhase::Codec) => {
                let stream = self.ingest_stream.clone().ok_or(SourceError::NotOpen)?;
                self.decoder = Some(create_decoder(&DecoderConfig::new(stream))?);
            }
            (Direction::Publish, OpenPhase::Converter) => {
                let converter = FrameConverter::new(self.source_format, self.config.target_format)?;
                let capacity = self.batch_bytes() * self.config.buffer_units;
                debug!(capacity, "Relay buffer allocated");
                self.converter = Some(converter);
                self.buffer = Some(Arc::new(RelayBuffer::new(capacity)));
            }
            (Direction::Play, OpenPhase::Converter) => {
                // Bound to the first decoded frame.
                self.converter = Some(FrameConverter::new(None, self.config.target_format)?);
            }
            (Direction::Publish, OpenPhase::Sink) => {
                let info = self
                    .encoder
                    .as_ref()
                    .map(|e| e.stream_info().clone())
                    .ok_or(SinkError::NotOpen)?;
                let publish = self.sink.as_publish_mut().ok_or(SinkError::NotOpen)?;
                publish.open(&info)?;
            }
            (Direction::Play, OpenPhase::Sink) => {
                let playback = self.sink.as_playback_mut().ok_or(SinkError::NotOpen)?;
                playback.open(&self.config.target_format)?;
            }
        }
        Ok(())
    }

    /// Release every opened phase in reverse order. Safe to call repeatedly.
    #[instrument(name = "close_pipeline", skip(self))]
    pub fn close_all(&mut self) {
        let Some(mut phase) = self.phase.take() else {
            return;
        };

        loop {
            self.close_phase(phase);
            match phase.previous() {
                Some(previous) => phase = previous,
                None => break,
            }
        }
        debug!("Pipeline closed");
    }

    fn close_phase(&mut self, phase: OpenPhase) {
        debug!(?phase, "Closing phase");
        match phase {
            OpenPhase::Sink => self.sink.close(),
            OpenPhase::Converter => {
                if let Some(buffer) = self.buffer.take() {
                    buffer.close();
                }
                self.converter = None;
            }
            OpenPhase::Codec => {
                self.encoder = None;
                self.decoder = None;
            }
            OpenPhase::Source => {
                self.source.close();
                self.source_format = None;
                self.ingest_stream = None;
            }
        }
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        self.close_all();
    }
}
