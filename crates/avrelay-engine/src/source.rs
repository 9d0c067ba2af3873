//! Source adapters: where a pipeline's media comes from.

use std::time::{Duration, Instant};

use avrelay_types::{
    CaptureDevice, DeviceError, EncodedPacket, Incoming, MediaFormat, MediaFrame, PacketReader,
    PipelineConfig, StreamInfo,
};
use bytes::BytesMut;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::SourceError;
use crate::SourceResult;

/// Raw frames from a local capture device.
pub struct LocalCaptureSource {
    device: Box<dyn CaptureDevice>,
    /// Set once `open` reaches the device, even if it then fails.
    engaged: bool,
    format: Option<MediaFormat>,
    pending: BytesMut,
    sequence: u64,
}

impl LocalCaptureSource {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            engaged: false,
            format: None,
            pending: BytesMut::new(),
            sequence: 0,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Negotiated capture format while open.
    pub fn format(&self) -> Option<MediaFormat> {
        self.format
    }

    /// Open the device with the configured source format. Returns the
    /// format the device actually delivers.
    #[instrument(name = "capture_source_open", skip_all, fields(device = %self.device.name()))]
    pub fn open(&mut self, config: &PipelineConfig) -> SourceResult<MediaFormat> {
        self.close();

        let requested = config.source_format.ok_or_else(|| {
            SourceError::Device(DeviceError::Unsupported("no capture format configured".into()))
        })?;
        self.engaged = true;
        let actual = self.device.open(&requested)?;
        if actual != requested {
            info!(requested = %requested, actual = %actual, "Device negotiated a different format");
        }

        self.format = Some(actual);
        self.sequence = 0;
        Ok(actual)
    }

    /// Pull the next run of whole units, waiting at most `timeout`.
    ///
    /// Device reads may end mid-unit; the remainder is held for the next call.
    pub fn pull_frame(&mut self, timeout: Duration) -> SourceResult<Incoming<MediaFrame>> {
        let format = self.format.ok_or(SourceError::NotOpen)?;
        let unit = format.unit_size();
        let deadline = Instant::now() + timeout;

        while self.pending.len() < unit {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Incoming::Timeout);
            }
            match self.device.read(remaining)? {
                Incoming::Data(chunk) => self.pending.extend_from_slice(&chunk),
                Incoming::Timeout => return Ok(Incoming::Timeout),
                Incoming::End => return Ok(Incoming::End),
            }
        }

        let whole = self.pending.len() / unit * unit;
        let payload = self.pending.split_to(whole).freeze();
        let frame = MediaFrame::new(payload, format, self.sequence)
            .map_err(|e| SourceError::Device(DeviceError::Backend(e.to_string())))?;
        trace!(sequence = self.sequence, units = frame.units(), "Captured");
        self.sequence += 1;
        Ok(Incoming::Data(frame))
    }

    /// Release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.format = None;
        if std::mem::take(&mut self.engaged) {
            self.device.close();
            debug!(device = %self.device.name(), "Capture source closed");
        }
        self.pending.clear();
    }
}

/// Compressed packets from a remote stream.
pub struct NetworkIngestSource {
    reader: Box<dyn PacketReader>,
    engaged: bool,
    stream: Option<StreamInfo>,
}

impl NetworkIngestSource {
    pub fn new(reader: Box<dyn PacketReader>) -> Self {
        Self {
            reader,
            engaged: false,
            stream: None,
        }
    }

    /// Probed stream while open.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream.as_ref()
    }

    /// Connect and probe the remote stream.
    #[instrument(name = "ingest_source_open", skip_all)]
    pub fn open(&mut self, config: &PipelineConfig) -> SourceResult<StreamInfo> {
        self.close();

        self.engaged = true;
        let info = self.reader.open()?;
        if info.codec != config.codec {
            warn!(
                configured = config.codec.name(),
                received = info.codec.name(),
                "Remote stream uses a different codec; decoding what was received"
            );
        }
        self.stream = Some(info.clone());
        Ok(info)
    }

    /// Pull the next packet, waiting at most `timeout`.
    pub fn pull_packet(&mut self, timeout: Duration) -> SourceResult<Incoming<EncodedPacket>> {
        if self.stream.is_none() {
            return Err(SourceError::NotOpen);
        }
        Ok(self.reader.read_packet(timeout)?)
    }

    /// Disconnect. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.stream = None;
        if std::mem::take(&mut self.engaged) {
            self.reader.close();
            debug!("Ingest source closed");
        }
    }
}

/// Where a pipeline's media comes from.
pub enum Source {
    LocalCapture(LocalCaptureSource),
    NetworkIngest(NetworkIngestSource),
}

impl Source {
    /// Source reading a capture device.
    pub fn capture(device: Box<dyn CaptureDevice>) -> Self {
        Self::LocalCapture(LocalCaptureSource::new(device))
    }

    /// Source reading a remote stream.
    pub fn ingest(reader: Box<dyn PacketReader>) -> Self {
        Self::NetworkIngest(NetworkIngestSource::new(reader))
    }

    /// Returns the display name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalCapture(_) => "LocalCapture",
            Self::NetworkIngest(_) => "NetworkIngest",
        }
    }

    pub fn as_capture_mut(&mut self) -> Option<&mut LocalCaptureSource> {
        match self {
            Self::LocalCapture(source) => Some(source),
            Self::NetworkIngest(_) => None,
        }
    }

    pub fn as_ingest_mut(&mut self) -> Option<&mut NetworkIngestSource> {
        match self {
            Self::NetworkIngest(source) => Some(source),
            Self::LocalCapture(_) => None,
        }
    }

    /// Release whatever the source holds. Safe to call repeatedly.
    pub fn close(&mut self) {
        match self {
            Self::LocalCapture(source) => source.close(),
            Self::NetworkIngest(source) => source.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::{
        AudioFormat, CodecId, DeviceResult, LinkError, LinkResult, SampleFormat, TimeBase,
    };
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::collections::VecDeque;

    struct ScriptedDevice {
        reads: VecDeque<Incoming<Bytes>>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
            Ok(*format)
        }

        fn read(&mut self, _timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
            Ok(self.reads.pop_front().unwrap_or(Incoming::Timeout))
        }

        fn close(&mut self) {}
    }

    fn config() -> PipelineConfig {
        let format = AudioFormat::new(SampleFormat::S16, 2, 48000);
        PipelineConfig::audio_publish("rtmp://localhost/live/test", format, CodecId::Pcm)
    }

    fn data(len: usize) -> Incoming<Bytes> {
        Incoming::Data(Bytes::from(vec![0u8; len]))
    }

    #[test]
    fn test_unaligned_reads_form_whole_units() {
        let device = ScriptedDevice {
            reads: VecDeque::from([data(3), data(7), data(2)]),
        };
        let mut source = LocalCaptureSource::new(Box::new(device));
        source.open(&config()).unwrap();

        // 3 + 7 bytes: two whole 4-byte samples, 2 bytes held back.
        let Incoming::Data(frame) = source.pull_frame(Duration::from_secs(1)).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.units(), 2);
        assert_eq!(frame.sequence(), 0);

        // Held-back 2 bytes + 2 more complete one sample.
        let Incoming::Data(frame) = source.pull_frame(Duration::from_secs(1)).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.units(), 1);
        assert_eq!(frame.sequence(), 1);

        assert!(source.pull_frame(Duration::from_secs(1)).unwrap().is_timeout());
    }

    #[test]
    fn test_pull_before_open_fails() {
        let device = ScriptedDevice {
            reads: VecDeque::new(),
        };
        let mut source = LocalCaptureSource::new(Box::new(device));
        assert!(matches!(
            source.pull_frame(Duration::from_millis(1)),
            Err(SourceError::NotOpen)
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_reopen_works() {
        let device = ScriptedDevice {
            reads: VecDeque::new(),
        };
        let mut source = Source::capture(Box::new(device));
        source.close();
        source.close();

        let capture = source.as_capture_mut().unwrap();
        capture.open(&config()).unwrap();
        capture.close();
        capture.close();
        capture.open(&config()).unwrap();
        assert!(capture.format().is_some());
        assert!(source.as_ingest_mut().is_none());
    }

    struct EmptyReader;

    impl PacketReader for EmptyReader {
        fn open(&mut self) -> LinkResult<StreamInfo> {
            let format = AudioFormat::new(SampleFormat::S16, 2, 48000);
            Ok(StreamInfo::new(CodecId::Pcm, format.into(), TimeBase::MILLIS))
        }

        fn read_packet(&mut self, _timeout: Duration) -> LinkResult<Incoming<EncodedPacket>> {
            Ok(Incoming::End)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_ingest_reports_end_of_stream() {
        let mut source = NetworkIngestSource::new(Box::new(EmptyReader));
        assert!(matches!(
            source.pull_packet(Duration::from_millis(1)),
            Err(SourceError::NotOpen)
        ));

        let mut config = config();
        config.direction = avrelay_types::Direction::Play;
        let info = source.open(&config).unwrap();
        assert_eq!(info.codec, CodecId::Pcm);
        assert!(source
            .pull_packet(Duration::from_millis(1))
            .unwrap()
            .is_end());
        source.close();
        source.close();
        assert!(source.stream_info().is_none());
    }

    struct HalfOpenReader {
        session: Arc<Mutex<bool>>,
    }

    impl PacketReader for HalfOpenReader {
        fn open(&mut self) -> LinkResult<StreamInfo> {
            *self.session.lock() = true;
            Err(LinkError::Timeout("no stream metadata".into()))
        }

        fn read_packet(&mut self, _timeout: Duration) -> LinkResult<Incoming<EncodedPacket>> {
            Err(LinkError::NotOpen)
        }

        fn close(&mut self) {
            *self.session.lock() = false;
        }
    }

    #[test]
    fn test_failed_probe_still_closes_reader() {
        let session = Arc::new(Mutex::new(false));
        let mut source = NetworkIngestSource::new(Box::new(HalfOpenReader {
            session: Arc::clone(&session),
        }));

        let mut config = config();
        config.direction = avrelay_types::Direction::Play;
        assert!(source.open(&config).is_err());
        assert!(*session.lock());

        source.close();
        assert!(!*session.lock());
        assert!(source.stream_info().is_none());
    }
}
