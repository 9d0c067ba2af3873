//! Pipeline orchestrator.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use avrelay_codec::{CodecError, DecoderSession, EncoderSession, Received, SendStatus};
use avrelay_convert::FrameConverter;
use avrelay_types::{
    ConfigError, ConnectionState, ConversionError, Direction, EncodedPacket, Incoming,
    MediaFormat, MediaFrame, PipelineConfig, PipelineEvent,
};
use crossbeam_channel::Sender;
use tracing::{debug, error, info, instrument, warn};

use crate::context::PipelineContext;
use crate::error::{BufferError, PipelineError, SourceError};
use crate::metrics::MetricsCollector;
use crate::relay_buffer::RelayBuffer;
use crate::sink::{LocalPlaybackSink, NetworkPublishSink, Sink};
use crate::source::{LocalCaptureSource, NetworkIngestSource, Source};
use crate::supervisor::Supervisor;
use crate::PipelineResult;

/// How a streaming session ended.
enum SessionEnd {
    Cancelled,
    Fault(PipelineError),
}

/// Borrowed state every session thread needs.
struct Shared<'a> {
    config: &'a PipelineConfig,
    cancel: &'a AtomicBool,
    stop: &'a AtomicBool,
    metrics: &'a MetricsCollector,
    events: &'a Sender<PipelineEvent>,
}

impl Shared<'_> {
    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst)
    }

    fn send_event(&self, event: PipelineEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }

    fn drop_unit(&self, sequence: Option<u64>, reason: &dyn Display) {
        self.metrics.record_drop();
        warn!(?sequence, "Dropped unit: {}", reason);
        self.send_event(PipelineEvent::UnitDropped {
            sequence,
            reason: reason.to_string(),
        });
    }

    /// Periodic status line and stats event.
    fn report_stats(&self, force: bool) {
        if !force && !self.metrics.report_due() {
            return;
        }
        let stats = self.metrics.snapshot();
        info!(
            units_in = stats.units_in,
            dropped = stats.units_dropped,
            units_out = stats.units_out,
            bytes = stats.bytes_out,
            stalls = stats.buffer_stalls,
            reconnects = stats.reconnects,
            "Pipeline stats: {:.1} units/s, {} kbps, uptime={:.1}s",
            stats.rate,
            stats.bitrate_kbps,
            self.metrics.uptime().as_secs_f32()
        );
        self.send_event(PipelineEvent::Stats(stats));
        self.metrics.mark_reported();
    }
}

/// Convert one frame, dropping it on a conversion error.
fn convert_or_drop(
    converter: &mut FrameConverter,
    frame: MediaFrame,
    shared: &Shared<'_>,
) -> Option<MediaFrame> {
    let sequence = frame.sequence();
    match converter.convert(frame) {
        Ok(converted) => Some(converted),
        Err(e) => {
            shared.drop_unit(Some(sequence), &e);
            None
        }
    }
}

/// Deliver every packet the encoder has ready. Returns how many were sent.
fn drain_packets(
    encoder: &mut dyn EncoderSession,
    sink: &mut NetworkPublishSink,
    shared: &Shared<'_>,
) -> PipelineResult<usize> {
    let mut sent = 0;
    loop {
        match encoder.receive_packet() {
            Ok(Received::Output(packet)) => {
                let size = packet.len();
                sink.write_packet(packet)?;
                shared.metrics.record_unit_out(size);
                sent += 1;
            }
            Ok(Received::NeedMoreInput | Received::EndOfStream) => return Ok(sent),
            Err(e) if e.is_unit() => {
                shared.drop_unit(None, &e);
                return Ok(sent);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Feed one frame (or end of stream) to the encoder, draining before and
/// after so the encoder never holds more than it must.
fn encode_and_send(
    encoder: &mut dyn EncoderSession,
    sink: &mut NetworkPublishSink,
    frame: Option<&MediaFrame>,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    loop {
        match encoder.send_frame(frame) {
            Ok(SendStatus::Accepted) => break,
            Ok(SendStatus::Busy) => {
                if drain_packets(encoder, sink, shared)? == 0 {
                    return Err(CodecError::Encoding(format!(
                        "{} busy without output",
                        encoder.name()
                    ))
                    .into());
                }
            }
            Err(e) if e.is_unit() => {
                shared.drop_unit(frame.map(MediaFrame::sequence), &e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    drain_packets(encoder, sink, shared)?;
    Ok(())
}

/// Pull frames from the device into the relay buffer.
fn capture_loop(
    capture: &mut LocalCaptureSource,
    buffer: &RelayBuffer,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    let read_timeout = shared.config.read_timeout();
    let idle_timeout = shared.config.idle_timeout();
    let mut last_data = Instant::now();

    while !shared.should_stop() {
        match capture.pull_frame(read_timeout)? {
            Incoming::Data(frame) => {
                last_data = Instant::now();
                match buffer.write(frame.payload()) {
                    Ok(false) => {}
                    Ok(true) => {
                        let total = shared.metrics.record_stall();
                        warn!(total, "Relay buffer full, capture stalled");
                        shared.send_event(PipelineEvent::BufferStall { total });
                    }
                    Err(BufferError::Closed) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            Incoming::Timeout => {
                let idle = last_data.elapsed();
                if idle >= idle_timeout {
                    return Err(SourceError::Idle(idle).into());
                }
            }
            Incoming::End => return Err(SourceError::EndOfStream.into()),
        }
    }

    debug!("Capture loop stopped");
    Ok(())
}

/// Consume whole batches, convert, encode and publish them.
fn process_loop(
    encoder: &mut dyn EncoderSession,
    converter: &mut FrameConverter,
    sink: &mut NetworkPublishSink,
    buffer: &RelayBuffer,
    format: MediaFormat,
    batch_bytes: usize,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    let poll_interval = shared.config.poll_interval();
    let mut sequence = 0u64;

    loop {
        shared.report_stats(false);
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let bytes = match buffer.consume_timeout(batch_bytes, poll_interval) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            // Capture is done; everything buffered has been processed.
            Err(BufferError::Closed) => break,
            Err(e) => return Err(e.into()),
        };
        shared.metrics.record_unit_in();

        let frame = match MediaFrame::new(bytes, format, sequence) {
            Ok(frame) => frame,
            Err(e) => {
                shared.drop_unit(Some(sequence), &e);
                sequence += 1;
                continue;
            }
        };
        sequence += 1;

        if let Some(frame) = convert_or_drop(converter, frame, shared) {
            encode_and_send(encoder, sink, Some(&frame), shared)?;
        }
    }

    debug!(batches = sequence, "Processing loop stopped");
    Ok(())
}

/// Convert a decoded frame for playback. A format change confirmed by the
/// decoder rebinds the converter; the frame that revealed it is dropped.
fn convert_decoded(
    converter: &mut FrameConverter,
    frame: MediaFrame,
    decoder_format: Option<MediaFormat>,
    shared: &Shared<'_>,
) -> PipelineResult<Option<MediaFrame>> {
    let sequence = frame.sequence();
    let format = *frame.format();

    match converter.convert(frame) {
        Ok(converted) => Ok(Some(converted)),
        Err(e @ ConversionError::FormatMismatch { .. }) if decoder_format == Some(format) => {
            info!(format = %format, "Decoded format changed, rebinding converter");
            *converter = FrameConverter::new(Some(format), converter.output_format())?;
            shared.drop_unit(Some(sequence), &e);
            Ok(None)
        }
        Err(e) => {
            shared.drop_unit(Some(sequence), &e);
            Ok(None)
        }
    }
}

/// Play every frame the decoder has ready. Returns how many were played.
fn drain_frames(
    decoder: &mut dyn DecoderSession,
    converter: &mut FrameConverter,
    sink: &mut LocalPlaybackSink,
    shared: &Shared<'_>,
) -> PipelineResult<usize> {
    let mut played = 0;
    loop {
        let frame = match decoder.receive_frame() {
            Ok(Received::Output(frame)) => frame,
            Ok(Received::NeedMoreInput | Received::EndOfStream) => return Ok(played),
            Err(e) if e.is_unit() => {
                shared.drop_unit(None, &e);
                return Ok(played);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(frame) = convert_decoded(converter, frame, decoder.output_format(), shared)? {
            sink.write_frame(&frame)?;
            shared.metrics.record_unit_out(frame.len());
            played += 1;
        }
    }
}

/// Feed one packet (or end of stream) to the decoder and play the output.
fn decode_and_play(
    decoder: &mut dyn DecoderSession,
    converter: &mut FrameConverter,
    sink: &mut LocalPlaybackSink,
    packet: Option<&EncodedPacket>,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    loop {
        match decoder.send_packet(packet) {
            Ok(SendStatus::Accepted) => break,
            Ok(SendStatus::Busy) => {
                if drain_frames(decoder, converter, sink, shared)? == 0 {
                    return Err(CodecError::Decoding(format!(
                        "{} busy without output",
                        decoder.name()
                    ))
                    .into());
                }
            }
            Err(e) if e.is_unit() => {
                shared.drop_unit(None, &e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    drain_frames(decoder, converter, sink, shared)?;
    Ok(())
}

/// Pull packets, decode, convert and play until cancelled or faulted.
fn play_loop(
    ingest: &mut NetworkIngestSource,
    decoder: &mut dyn DecoderSession,
    converter: &mut FrameConverter,
    sink: &mut LocalPlaybackSink,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    let read_timeout = shared.config.read_timeout();
    let idle_timeout = shared.config.idle_timeout();
    let mut last_data = Instant::now();

    while !shared.should_stop() {
        shared.report_stats(false);
        match ingest.pull_packet(read_timeout)? {
            Incoming::Data(packet) => {
                last_data = Instant::now();
                shared.metrics.record_unit_in();
                decode_and_play(decoder, converter, sink, Some(&packet), shared)?;
            }
            Incoming::Timeout => {
                let idle = last_data.elapsed();
                if idle >= idle_timeout {
                    return Err(SourceError::Idle(idle).into());
                }
            }
            Incoming::End => return Err(SourceError::EndOfStream.into()),
        }
    }
    Ok(())
}

fn check_adapters(config: &PipelineConfig, source: &Source, sink: &Sink) -> PipelineResult<()> {
    let matched = matches!(
        (config.direction, source, sink),
        (Direction::Publish, Source::LocalCapture(_), Sink::NetworkPublish(_))
            | (Direction::Play, Source::NetworkIngest(_), Sink::LocalPlayback(_))
    );
    if matched {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        field: "direction",
        reason: format!(
            "{} pipeline cannot run {} -> {}",
            config.direction.name(),
            source.name(),
            sink.name()
        ),
    }
    .into())
}

/// A relay pipeline: source, converter, codec and sink under a supervisor.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    context: PipelineContext,
    supervisor: Supervisor,
    metrics: Arc<MetricsCollector>,
    events: Sender<PipelineEvent>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    /// Build a pipeline. Fails on an invalid configuration or on adapters
    /// that do not match the configured direction.
    pub fn new(
        config: impl Into<Arc<PipelineConfig>>,
        source: Source,
        sink: Sink,
        events: Sender<PipelineEvent>,
    ) -> PipelineResult<Self> {
        let config = config.into();
        config.validate()?;
        check_adapters(&config, &source, &sink)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let supervisor = Supervisor::new(config.retry.clone(), events.clone(), Arc::clone(&cancel));

        Ok(Self {
            context: PipelineContext::new(Arc::clone(&config), source, sink),
            config,
            supervisor,
            metrics: Arc::new(MetricsCollector::default()),
            events,
            cancel,
        })
    }

    /// Flag that stops the pipeline when raised. Loops observe it within
    /// one iteration.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request shutdown.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// Counters.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Supervisor bookkeeping.
    pub fn connection_state(&self) -> &ConnectionState {
        self.supervisor.state()
    }

    /// Run until cancelled (`Ok`) or until a configuration error (`Err`).
    /// Transient faults reconnect with the same configuration.
    #[instrument(name = "pipeline_run", skip(self), fields(direction = self.config.direction.name()))]
    pub fn run(&mut self) -> PipelineResult<()> {
        info!(
            codec = self.config.codec.name(),
            target = %self.config.target_format,
            "Pipeline starting"
        );
        self.metrics.start();
        let mut sessions = 0u64;

        let result = loop {
            match self.supervisor.connect(&mut self.context) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
            if sessions > 0 {
                self.metrics.record_reconnect();
            }
            sessions += 1;

            let end = match self.config.direction {
                Direction::Publish => self.run_publish(),
                Direction::Play => self.run_play(),
            };

            match end {
                SessionEnd::Cancelled => {
                    self.flush();
                    break Ok(());
                }
                SessionEnd::Fault(e) if e.is_config() => {
                    error!("Pipeline stopped: {}", e);
                    break Err(e);
                }
                SessionEnd::Fault(e) => {
                    if !self.supervisor.fault(&mut self.context, &e) {
                        debug!("Cancelled while waiting to reconnect");
                        break Ok(());
                    }
                }
            }
        };

        self.supervisor.close(&mut self.context);
        self.shared(&AtomicBool::new(false)).report_stats(true);
        self.metrics.stop();
        info!("Pipeline stopped");
        result
    }

    fn shared<'a>(&'a self, stop: &'a AtomicBool) -> Shared<'a> {
        Shared {
            config: &self.config,
            cancel: &self.cancel,
            stop,
            metrics: &self.metrics,
            events: &self.events,
        }
    }

    #[instrument(name = "publish_session", skip(self))]
    fn run_publish(&mut self) -> SessionEnd {
        let stop = AtomicBool::new(false);
        let shared = Shared {
            config: &self.config,
            cancel: &self.cancel,
            stop: &stop,
            metrics: &self.metrics,
            events: &self.events,
        };

        let batch_bytes = self.context.batch_bytes();
        let (Some(capture), Some(encoder), Some(converter), Some(sink), Some(buffer), Some(format)) = (
            self.context.source.as_capture_mut(),
            self.context.encoder.as_deref_mut(),
            self.context.converter.as_mut(),
            self.context.sink.as_publish_mut(),
            self.context.buffer.as_ref().map(Arc::clone),
            self.context.source_format,
        ) else {
            return SessionEnd::Fault(SourceError::NotOpen.into());
        };

        let shared = &shared;
        let buffer = &*buffer;
        thread::scope(|scope| {
            let capture_thread = thread::Builder::new()
                .name("avrelay-capture".into())
                .spawn_scoped(scope, move || {
                    let result = capture_loop(capture, buffer, shared);
                    if result.is_err() {
                        shared.stop.store(true, Ordering::SeqCst);
                    }
                    buffer.close();
                    result
                });
            let capture_thread = match capture_thread {
                Ok(handle) => handle,
                Err(e) => return SessionEnd::Fault(PipelineError::Thread(e.to_string())),
            };

            let processing_thread = thread::Builder::new()
                .name("avrelay-process".into())
                .spawn_scoped(scope, move || {
                    let result =
                        process_loop(encoder, converter, sink, buffer, format, batch_bytes, shared);
                    if result.is_err() {
                        shared.stop.store(true, Ordering::SeqCst);
                    }
                    buffer.close();
                    result
                });

            let processed = match processing_thread {
                Ok(handle) => handle.join(),
                Err(e) => {
                    shared.stop.store(true, Ordering::SeqCst);
                    buffer.close();
                    Ok(Err(PipelineError::Thread(e.to_string())))
                }
            };
            let captured = capture_thread.join();

            match (processed, captured) {
                (Err(_), _) => SessionEnd::Fault(PipelineError::Thread("processing thread panicked".into())),
                (_, Err(_)) => SessionEnd::Fault(PipelineError::Thread("capture thread panicked".into())),
                (Ok(Err(e)), _) | (_, Ok(Err(e))) => SessionEnd::Fault(e),
                (Ok(Ok(())), Ok(Ok(()))) if shared.cancel.load(Ordering::SeqCst) => SessionEnd::Cancelled,
                (Ok(Ok(())), Ok(Ok(()))) => SessionEnd::Fault(SourceError::EndOfStream.into()),
            }
        })
    }

    #[instrument(name = "play_session", skip(self))]
    fn run_play(&mut self) -> SessionEnd {
        let stop = AtomicBool::new(false);
        let shared = Shared {
            config: &self.config,
            cancel: &self.cancel,
            stop: &stop,
            metrics: &self.metrics,
            events: &self.events,
        };

        let (Some(ingest), Some(decoder), Some(converter), Some(sink)) = (
            self.context.source.as_ingest_mut(),
            self.context.decoder.as_deref_mut(),
            self.context.converter.as_mut(),
            self.context.sink.as_playback_mut(),
        ) else {
            return SessionEnd::Fault(SourceError::NotOpen.into());
        };

        match play_loop(ingest, decoder, converter, sink, &shared) {
            Ok(()) => SessionEnd::Cancelled,
            Err(e) => SessionEnd::Fault(e),
        }
    }

    /// Drain the codec and converter into the sink before shutdown.
    #[instrument(name = "pipeline_flush", skip(self))]
    fn flush(&mut self) {
        let stop = AtomicBool::new(false);
        let shared = Shared {
            config: &self.config,
            cancel: &self.cancel,
            stop: &stop,
            metrics: &self.metrics,
            events: &self.events,
        };
        let tail_sequence = self.metrics.snapshot().units_in;

        let result = match self.config.direction {
            Direction::Publish => {
                let (Some(encoder), Some(converter), Some(sink)) = (
                    self.context.encoder.as_deref_mut(),
                    self.context.converter.as_mut(),
                    self.context.sink.as_publish_mut(),
                ) else {
                    return;
                };
                flush_publish(encoder, converter, sink, tail_sequence, &shared)
            }
            Direction::Play => {
                let (Some(decoder), Some(converter), Some(sink)) = (
                    self.context.decoder.as_deref_mut(),
                    self.context.converter.as_mut(),
                    self.context.sink.as_playback_mut(),
                ) else {
                    return;
                };
                flush_play(decoder, converter, sink, tail_sequence, &shared)
            }
        };

        match result {
            Ok(()) => debug!("Pipeline flushed"),
            Err(e) => warn!("Flush incomplete: {}", e),
        }
    }
}

fn flush_publish(
    encoder: &mut dyn EncoderSession,
    converter: &mut FrameConverter,
    sink: &mut NetworkPublishSink,
    tail_sequence: u64,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    if let Some(tail) = converter.flush(tail_sequence)? {
        encode_and_send(encoder, sink, Some(&tail), shared)?;
    }
    encode_and_send(encoder, sink, None, shared)?;
    sink.finish()?;
    Ok(())
}

fn flush_play(
    decoder: &mut dyn DecoderSession,
    converter: &mut FrameConverter,
    sink: &mut LocalPlaybackSink,
    tail_sequence: u64,
    shared: &Shared<'_>,
) -> PipelineResult<()> {
    decode_and_play(decoder, converter, sink, None, shared)?;
    if let Some(tail) = converter.flush(tail_sequence)? {
        sink.write_frame(&tail)?;
        shared.metrics.record_unit_out(tail.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::{event_channel, AudioFormat, SampleFormat};

    fn format(rate: u32) -> MediaFormat {
        MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, rate))
    }

    #[test]
    fn test_mismatched_frame_dropped_and_next_processed() {
        let config = PipelineConfig::audio_publish(
            "rtmp://localhost/live/x",
            AudioFormat::new(SampleFormat::S16, 2, 48000),
            avrelay_types::CodecId::Pcm,
        );
        let (events, rx) = event_channel();
        let cancel = AtomicBool::new(false);
        let stop = AtomicBool::new(false);
        let metrics = MetricsCollector::default();
        let shared = Shared {
            config: &config,
            cancel: &cancel,
            stop: &stop,
            metrics: &metrics,
            events: &events,
        };

        let mut converter = FrameConverter::new(Some(format(48000)), format(48000)).unwrap();

        let corrupted = MediaFrame::new(vec![0u8; 8], format(44100), 0).unwrap();
        assert!(convert_or_drop(&mut converter, corrupted, &shared).is_none());

        let good = MediaFrame::new(vec![1u8; 8], format(48000), 1).unwrap();
        let out = convert_or_drop(&mut converter, good, &shared).unwrap();
        assert_eq!(out.sequence(), 1);

        assert_eq!(metrics.snapshot().units_dropped, 1);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            PipelineEvent::UnitDropped {
                sequence: Some(0),
                ..
            }
        ));
        assert!(!stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_adapters_must_match_direction() {
        struct Nothing;
        impl avrelay_types::PlaybackDevice for Nothing {
            fn name(&self) -> &str {
                "nothing"
            }
            fn open(&mut self, _format: &MediaFormat) -> avrelay_types::DeviceResult<()> {
                Ok(())
            }
            fn write(&mut self, _frame: &MediaFrame) -> avrelay_types::DeviceResult<()> {
                Ok(())
            }
            fn close(&mut self) {}
        }
        struct NoReader;
        impl avrelay_types::PacketReader for NoReader {
            fn open(&mut self) -> avrelay_types::LinkResult<avrelay_types::StreamInfo> {
                Err(avrelay_types::LinkError::NotOpen)
            }
            fn read_packet(
                &mut self,
                _timeout: std::time::Duration,
            ) -> avrelay_types::LinkResult<Incoming<EncodedPacket>> {
                Ok(Incoming::End)
            }
            fn close(&mut self) {}
        }

        let config = PipelineConfig::audio_publish(
            "rtmp://localhost/live/x",
            AudioFormat::new(SampleFormat::S16, 2, 48000),
            avrelay_types::CodecId::Pcm,
        );
        let (events, _rx) = event_channel();
        let result = Pipeline::new(
            config,
            Source::ingest(Box::new(NoReader)),
            Sink::playback(Box::new(Nothing)),
            events,
        );
        let err = result.err().unwrap();
        assert!(err.is_config());
    }

    struct CorruptDecoder;

    impl DecoderSession for CorruptDecoder {
        fn name(&self) -> &'static str {
            "corrupt"
        }

        fn output_format(&self) -> Option<MediaFormat> {
            None
        }

        fn send_packet(&mut self, _packet: Option<&EncodedPacket>) -> avrelay_codec::CodecResult<SendStatus> {
            Err(CodecError::Decoding("bad slice".into()))
        }

        fn receive_frame(&mut self) -> avrelay_codec::CodecResult<Received<MediaFrame>> {
            Ok(Received::NeedMoreInput)
        }
    }

    #[test]
    fn test_undecodable_packet_dropped_without_sequence() {
        let config = PipelineConfig::audio_play(
            "rtmp://localhost/live/x",
            AudioFormat::new(SampleFormat::S16, 2, 48000),
            avrelay_types::CodecId::Pcm,
        );
        let (events, rx) = event_channel();
        let cancel = AtomicBool::new(false);
        let stop = AtomicBool::new(false);
        let metrics = MetricsCollector::default();
        let shared = Shared {
            config: &config,
            cancel: &cancel,
            stop: &stop,
            metrics: &metrics,
            events: &events,
        };

        struct Silent;
        impl avrelay_types::PlaybackDevice for Silent {
            fn name(&self) -> &str {
                "silent"
            }
            fn open(&mut self, _format: &MediaFormat) -> avrelay_types::DeviceResult<()> {
                Ok(())
            }
            fn write(&mut self, _frame: &MediaFrame) -> avrelay_types::DeviceResult<()> {
                Ok(())
            }
            fn close(&mut self) {}
        }

        let mut converter = FrameConverter::new(None, format(48000)).unwrap();
        let mut sink = LocalPlaybackSink::new(Box::new(Silent));
        let packet = EncodedPacket::new(vec![0u8; 4], 4_000, avrelay_types::TimeBase::MILLIS);

        decode_and_play(&mut CorruptDecoder, &mut converter, &mut sink, Some(&packet), &shared)
            .unwrap();

        assert_eq!(metrics.snapshot().units_dropped, 1);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            &events[..],
            [PipelineEvent::UnitDropped { sequence: None, .. }]
        ));
    }
}
