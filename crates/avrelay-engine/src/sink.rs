//! Sink adapters: where a pipeline's media goes.

use std::collections::HashMap;

use avrelay_types::{
    EncodedPacket, MediaFormat, MediaFrame, PacketWriter, PlaybackDevice, StreamInfo,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::SinkError;
use crate::{SinkResult, TRANSPORT_TIME_BASE};

/// Keeps decode timestamps non-decreasing per stream.
#[derive(Debug, Default)]
pub struct DtsGuard {
    last: HashMap<usize, i64>,
}

impl DtsGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp a regressing `dts` to the last delivered value. Returns true if
    /// the packet was adjusted.
    pub fn apply(&mut self, packet: &mut EncodedPacket) -> bool {
        let last = self.last.entry(packet.stream_index).or_insert(i64::MIN);
        let clamped = packet.dts < *last;
        if clamped {
            packet.dts = *last;
            packet.pts = packet.pts.max(packet.dts);
        }
        *last = packet.dts;
        clamped
    }

    /// Forget every stream.
    pub fn reset(&mut self) {
        self.last.clear();
    }
}

/// Compressed packets to a remote server.
pub struct NetworkPublishSink {
    writer: Box<dyn PacketWriter>,
    /// Set once `open` reaches the writer, even if it then fails.
    engaged: bool,
    stream: Option<StreamInfo>,
    finished: bool,
    guard: DtsGuard,
    packets: u64,
    bytes: u64,
}

impl NetworkPublishSink {
    pub fn new(writer: Box<dyn PacketWriter>) -> Self {
        Self {
            writer,
            engaged: false,
            stream: None,
            finished: false,
            guard: DtsGuard::new(),
            packets: 0,
            bytes: 0,
        }
    }

    /// Returns true while a connection is open.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect and write the stream header.
    #[instrument(name = "publish_sink_open", skip_all, fields(codec = info.codec.name()))]
    pub fn open(&mut self, info: &StreamInfo) -> SinkResult<()> {
        self.close();

        self.finished = false;
        self.guard.reset();
        self.packets = 0;
        self.bytes = 0;
        self.engaged = true;
        self.writer.open(info)?;
        self.stream = Some(info.clone());
        Ok(())
    }

    /// Deliver one packet, rescaled to the transport time base.
    pub fn write_packet(&mut self, packet: EncodedPacket) -> SinkResult<()> {
        if self.stream.is_none() || self.finished {
            return Err(SinkError::NotOpen);
        }

        let mut packet = packet.rescale(TRANSPORT_TIME_BASE);
        if self.guard.apply(&mut packet) {
            debug!(
                stream = packet.stream_index,
                dts = packet.dts,
                "Clamped regressing decode timestamp"
            );
        }

        self.writer.write_packet(&packet)?;
        self.packets += 1;
        self.bytes += packet.len() as u64;
        trace!(dts = packet.dts, size = packet.len(), keyframe = packet.keyframe, "Packet sent");
        Ok(())
    }

    /// Write the trailer. Later writes fail until the next open.
    pub fn finish(&mut self) -> SinkResult<()> {
        if self.stream.is_none() || self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer.finish()?;
        Ok(())
    }

    /// Finalize if needed, then disconnect. Also releases whatever a failed
    /// `open` left behind. Safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.engaged {
            return;
        }
        if let Err(e) = self.finish() {
            debug!("Trailer not written: {}", e);
        }
        self.writer.close();
        self.engaged = false;
        self.stream = None;
        info!(packets = self.packets, bytes = self.bytes, "Publish sink closed");
    }
}

/// Raw frames to a local playback device.
pub struct LocalPlaybackSink {
    device: Box<dyn PlaybackDevice>,
    engaged: bool,
    format: Option<MediaFormat>,
}

impl LocalPlaybackSink {
    pub fn new(device: Box<dyn PlaybackDevice>) -> Self {
        Self {
            device,
            engaged: false,
            format: None,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Open the device for `format`.
    #[instrument(name = "playback_sink_open", skip_all, fields(device = %self.device.name(), format = %format))]
    pub fn open(&mut self, format: &MediaFormat) -> SinkResult<()> {
        self.close();
        self.engaged = true;
        self.device.open(format)?;
        self.format = Some(*format);
        Ok(())
    }

    /// Play one frame, blocking until the device takes it.
    pub fn write_frame(&mut self, frame: &MediaFrame) -> SinkResult<()> {
        let format = self.format.ok_or(SinkError::NotOpen)?;
        if *frame.format() != format {
            warn!(expected = %format, actual = %frame.format(), "Frame format differs from device format");
        }
        self.device.write(frame)?;
        Ok(())
    }

    /// Release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.format = None;
        if std::mem::take(&mut self.engaged) {
            self.device.close();
            debug!(device = %self.device.name(), "Playback sink closed");
        }
    }
}

/// Where a pipeline's media goes.
pub enum Sink {
    NetworkPublish(NetworkPublishSink),
    LocalPlayback(LocalPlaybackSink),
}

impl Sink {
    /// Sink publishing to a remote server.
    pub fn publish(writer: Box<dyn PacketWriter>) -> Self {
        Self::NetworkPublish(NetworkPublishSink::new(writer))
    }

    /// Sink playing on a local device.
    pub fn playback(device: Box<dyn PlaybackDevice>) -> Self {
        Self::LocalPlayback(LocalPlaybackSink::new(device))
    }

    /// Returns the display name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NetworkPublish(_) => "NetworkPublish",
            Self::LocalPlayback(_) => "LocalPlayback",
        }
    }

    pub fn as_publish_mut(&mut self) -> Option<&mut NetworkPublishSink> {
        match self {
            Self::NetworkPublish(sink) => Some(sink),
            Self::LocalPlayback(_) => None,
        }
    }

    pub fn as_playback_mut(&mut self) -> Option<&mut LocalPlaybackSink> {
        match self {
            Self::LocalPlayback(sink) => Some(sink),
            Self::NetworkPublish(_) => None,
        }
    }

    /// Release whatever the sink holds. Safe to call repeatedly.
    pub fn close(&mut self) {
        match self {
            Self::NetworkPublish(sink) => sink.close(),
            Self::LocalPlayback(sink) => sink.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use avrelay_types::{
        AudioFormat, CodecId, DeviceError, DeviceResult, LinkError, LinkResult, SampleFormat,
        TimeBase,
    };
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Log {
        opens: usize,
        finishes: usize,
        closes: usize,
        dts: Vec<i64>,
        connected: bool,
        fail_open_after_connect: bool,
    }

    struct RecordingWriter(Arc<Mutex<Log>>);

    impl PacketWriter for RecordingWriter {
        fn open(&mut self, _info: &StreamInfo) -> LinkResult<()> {
            let mut log = self.0.lock();
            log.opens += 1;
            if log.fail_open_after_connect {
                log.connected = true;
                return Err(LinkError::Protocol("sequence header rejected".into()));
            }
            log.connected = true;
            Ok(())
        }

        fn write_packet(&mut self, packet: &EncodedPacket) -> LinkResult<()> {
            self.0.lock().dts.push(packet.dts);
            Ok(())
        }

        fn finish(&mut self) -> LinkResult<()> {
            self.0.lock().finishes += 1;
            Ok(())
        }

        fn close(&mut self) {
            let mut log = self.0.lock();
            log.closes += 1;
            log.connected = false;
        }
    }

    fn stream() -> StreamInfo {
        let format = AudioFormat::new(SampleFormat::S16, 2, 48000);
        StreamInfo::new(CodecId::Pcm, format.into(), TimeBase::per_second(48000))
    }

    #[test]
    fn test_dts_guard_clamps_regression() {
        let mut guard = DtsGuard::new();
        let mut packet = EncodedPacket::new(vec![0u8], 10, TimeBase::MILLIS);
        assert!(!guard.apply(&mut packet));

        let mut packet = EncodedPacket::new(vec![0u8], 7, TimeBase::MILLIS);
        assert!(guard.apply(&mut packet));
        assert_eq!(packet.dts, 10);
        assert_eq!(packet.pts, 10);

        let mut other = EncodedPacket::new(vec![0u8], 3, TimeBase::MILLIS);
        other.stream_index = 1;
        assert!(!guard.apply(&mut other));
    }

    #[test]
    fn test_publish_rescales_and_keeps_order() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut sink = NetworkPublishSink::new(Box::new(RecordingWriter(Arc::clone(&log))));
        sink.open(&stream()).unwrap();

        let rate = TimeBase::per_second(48000);
        for samples in [0, 48000, 24000, 96000] {
            sink.write_packet(EncodedPacket::new(vec![0u8; 4], samples, rate))
                .unwrap();
        }
        sink.close();

        let log = log.lock();
        assert_eq!(log.dts, vec![0, 1000, 1000, 2000]);
        assert_eq!((log.opens, log.finishes, log.closes), (1, 1, 1));
    }

    #[test]
    fn test_publish_close_is_idempotent() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut sink = Sink::publish(Box::new(RecordingWriter(Arc::clone(&log))));
        sink.close();
        sink.close();
        assert_eq!(log.lock().closes, 0);

        let publish = sink.as_publish_mut().unwrap();
        publish.open(&stream()).unwrap();
        publish.finish().unwrap();
        assert!(matches!(
            publish.write_packet(EncodedPacket::new(vec![0u8], 0, TimeBase::MILLIS)),
            Err(SinkError::NotOpen)
        ));
        sink.close();
        sink.close();

        let log = log.lock();
        assert_eq!((log.opens, log.finishes, log.closes), (1, 1, 1));
    }

    #[test]
    fn test_close_after_failed_open_releases_writer() {
        let log = Arc::new(Mutex::new(Log {
            fail_open_after_connect: true,
            ..Log::default()
        }));
        let mut sink = NetworkPublishSink::new(Box::new(RecordingWriter(Arc::clone(&log))));

        assert!(sink.open(&stream()).is_err());
        assert!(!sink.is_open());
        sink.close();
        sink.close();

        let log = log.lock();
        assert!(!log.connected);
        assert_eq!((log.opens, log.finishes, log.closes), (1, 0, 1));
    }

    struct FlakyDevice {
        closes: Arc<Mutex<usize>>,
    }

    impl PlaybackDevice for FlakyDevice {
        fn name(&self) -> &str {
            "flaky"
        }

        fn open(&mut self, _format: &MediaFormat) -> DeviceResult<()> {
            Err(DeviceError::Busy("flaky".into()))
        }

        fn write(&mut self, _frame: &MediaFrame) -> DeviceResult<()> {
            Ok(())
        }

        fn close(&mut self) {
            *self.closes.lock() += 1;
        }
    }

    #[test]
    fn test_playback_close_after_failed_open() {
        let closes = Arc::new(Mutex::new(0));
        let mut sink = LocalPlaybackSink::new(Box::new(FlakyDevice {
            closes: Arc::clone(&closes),
        }));
        let format: MediaFormat = AudioFormat::new(SampleFormat::S16, 2, 48000).into();

        assert!(sink.open(&format).is_err());
        sink.close();
        sink.close();
        assert_eq!(*closes.lock(), 1);
    }
}
