//! RTMP playback link.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use avrelay_types::{
    AudioFormat, CodecId, EncodedPacket, Incoming, LinkError, LinkResult, MediaKind,
    PacketReader, PixelFormat, SampleFormat, StreamInfo, TimeBase, VideoFormat,
};
use bytes::{Bytes, BytesMut};
use rml_rtmp::sessions::StreamMetadata;
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::{MediaMessage, RtmpConnection, RtmpUrl};
use crate::error::TransportError;
use crate::flv::{parse_audio_specific_config, parse_audio_tag, parse_video_tag, AudioTag};
use crate::nal::{parse_avcc, to_annex_b, AvcDecoderConfig};
use crate::{build_runtime, TransportResult, TransportStatistics, CONNECT_TIMEOUT_MS, PROBE_TIMEOUT_MS};

/// What the probe has learned about the selected stream.
#[derive(Debug, Default)]
struct Probe {
    metadata: Option<StreamMetadata>,
    codec: Option<CodecId>,
    audio_tag: Option<(u32, u16)>,
    audio_config: Option<Bytes>,
    avc_config: Option<AvcDecoderConfig>,
}

impl Probe {
    /// Enough is known to describe the stream.
    fn is_complete(&self) -> bool {
        match self.codec {
            Some(CodecId::Aac) => self.audio_config.is_some(),
            Some(CodecId::H264) => self.avc_config.is_some(),
            Some(CodecId::Pcm) => true,
            None => false,
        }
    }

    fn stream_info(&self) -> TransportResult<StreamInfo> {
        let metadata = self.metadata.as_ref();
        let codec = self
            .codec
            .ok_or_else(|| TransportError::Timeout("no media within the probe window".into()))?;

        let mut info = match codec {
            CodecId::Aac => {
                let config = self.audio_config.clone().unwrap_or_default();
                let (sample_rate, channels) = parse_audio_specific_config(&config)?;
                let format = AudioFormat::new(SampleFormat::S16, channels, sample_rate);
                let mut info = StreamInfo::new(codec, format.into(), TimeBase::MILLIS);
                info.extradata = config;
                info
            }
            CodecId::Pcm => {
                let (tag_rate, tag_channels) = self.audio_tag.unwrap_or((44100, 2));
                // The tag header rate is coarse; metadata carries the exact one.
                let sample_rate = metadata
                    .and_then(|m| m.audio_sample_rate)
                    .unwrap_or(tag_rate);
                let channels = metadata
                    .and_then(|m| m.audio_channels)
                    .map_or(tag_channels, |c| c as u16);
                let format = AudioFormat::new(SampleFormat::S16, channels, sample_rate);
                StreamInfo::new(codec, format.into(), TimeBase::MILLIS)
            }
            CodecId::H264 => {
                let width = metadata.and_then(|m| m.video_width).unwrap_or(0);
                let height = metadata.and_then(|m| m.video_height).unwrap_or(0);
                let fps = metadata
                    .and_then(|m| m.video_frame_rate)
                    .map_or(0, |f| f.round() as u32);
                let format = VideoFormat::new(PixelFormat::Yuv420p, width, height, fps);
                let mut info = StreamInfo::new(codec, format.into(), TimeBase::MILLIS);
                info.extradata = self
                    .avc_config
                    .as_ref()
                    .map(AvcDecoderConfig::to_annex_b)
                    .unwrap_or_default();
                info
            }
        };

        info.bitrate_kbps = metadata
            .and_then(|m| match codec.kind() {
                MediaKind::Audio => m.audio_bitrate_kbps,
                MediaKind::Video => m.video_bitrate_kbps,
            })
            .unwrap_or(0);
        Ok(info)
    }
}

/// Pulls one elementary stream of the chosen kind from an RTMP server.
///
/// Packets of the other kind are read and discarded. Timestamps are the
/// RTMP millisecond timestamps; video presentation times add the tag's
/// composition offset.
pub struct RtmpPlayer {
    url: RtmpUrl,
    kind: MediaKind,
    connect_timeout: Duration,
    probe_timeout: Duration,
    runtime: Option<Runtime>,
    connection: Option<RtmpConnection>,
    probe: Probe,
    pending: VecDeque<EncodedPacket>,
    /// Parameter sets changed mid-stream; prefix the next keyframe.
    inject_parameter_sets: bool,
    stats: TransportStatistics,
}

impl RtmpPlayer {
    /// Create a player for `kind`. Fails only on a malformed URL.
    pub fn new(url: &str, kind: MediaKind) -> TransportResult<Self> {
        Ok(Self {
            url: RtmpUrl::parse(url)?,
            kind,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            runtime: None,
            connection: None,
            probe: Probe::default(),
            pending: VecDeque::new(),
            inject_parameter_sets: false,
            stats: TransportStatistics::default(),
        })
    }

    /// Bound on each connect, handshake and request step.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long to wait for stream parameters after play starts.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Counters for the current connection.
    pub fn statistics(&self) -> TransportStatistics {
        self.stats.clone()
    }

    /// Wait up to `wait` for socket input. `Ok(false)` means nothing arrived.
    fn poll(&mut self, wait: Duration) -> TransportResult<bool> {
        let (Some(runtime), Some(connection)) = (self.runtime.as_ref(), self.connection.as_mut())
        else {
            return Err(TransportError::NotConnected);
        };
        runtime.block_on(connection.poll(wait))
    }

    /// Feed every queued media message through [`Self::ingest`].
    fn drain_messages(&mut self) -> TransportResult<()> {
        while let Some(message) = self.connection.as_mut().and_then(RtmpConnection::next_media) {
            match self.ingest(message) {
                Ok(()) => {}
                Err(TransportError::Protocol(reason)) => {
                    warn!(reason = %reason, "Discarding malformed tag");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn ingest(&mut self, message: MediaMessage) -> TransportResult<()> {
        match message {
            MediaMessage::Metadata(metadata) => {
                debug!(?metadata, "Stream metadata");
                self.probe.metadata = Some(metadata);
            }
            MediaMessage::Audio { data, timestamp } if self.kind == MediaKind::Audio => {
                let tag = parse_audio_tag(&data)?;
                self.ingest_audio(tag, timestamp)?;
            }
            MediaMessage::Video { data, timestamp } if self.kind == MediaKind::Video => {
                self.ingest_video(&data, timestamp)?;
            }
            MediaMessage::Audio { .. } | MediaMessage::Video { .. } => {
                trace!("Skipping packet of the unselected kind");
            }
        }
        Ok(())
    }

    fn ingest_audio(&mut self, tag: AudioTag, timestamp: u32) -> TransportResult<()> {
        if let Some(codec) = self.probe.codec.filter(|c| *c != tag.codec) {
            return Err(TransportError::Unsupported(format!(
                "audio codec changed from {} to {}",
                codec.name(),
                tag.codec.name()
            )));
        }
        self.probe.codec = Some(tag.codec);
        self.probe.audio_tag = Some((tag.sample_rate, tag.channels));

        if tag.sequence_header {
            debug!(config_bytes = tag.data.len(), "AAC sequence header");
            self.probe.audio_config = Some(tag.data);
            return Ok(());
        }
        if tag.data.is_empty() {
            return Ok(());
        }

        let packet = EncodedPacket::new(tag.data, timestamp as i64, TimeBase::MILLIS)
            .with_keyframe(true);
        self.pending.push_back(packet);
        Ok(())
    }

    fn ingest_video(&mut self, data: &Bytes, timestamp: u32) -> TransportResult<()> {
        let tag = parse_video_tag(data)?;
        self.probe.codec = Some(CodecId::H264);

        if tag.sequence_header {
            let config = AvcDecoderConfig::parse(&tag.data)?;
            debug!(
                profile = config.profile,
                level = config.level,
                "AVC sequence header"
            );
            if self.probe.avc_config.as_ref().is_some_and(|c| *c != config) {
                self.inject_parameter_sets = true;
            }
            self.probe.avc_config = Some(config);
            return Ok(());
        }
        if tag.end_of_sequence || tag.data.is_empty() {
            return Ok(());
        }

        let Some(config) = self.probe.avc_config.as_ref() else {
            trace!(timestamp, "Skipping picture before sequence header");
            return Ok(());
        };
        let nals = parse_avcc(&tag.data, config.length_size)?;

        let mut payload = BytesMut::new();
        if self.inject_parameter_sets && tag.keyframe {
            payload.extend_from_slice(&config.to_annex_b());
            self.inject_parameter_sets = false;
        }
        payload.extend_from_slice(&to_annex_b(&nals));

        let mut packet = EncodedPacket::new(payload.freeze(), timestamp as i64, TimeBase::MILLIS)
            .with_keyframe(tag.keyframe);
        packet.pts = packet.dts + tag.composition_time as i64;
        self.pending.push_back(packet);
        Ok(())
    }

    /// Read until the stream can be described or the probe window closes.
    fn probe(&mut self) -> TransportResult<StreamInfo> {
        let deadline = Instant::now() + self.probe_timeout;
        loop {
            self.drain_messages()?;
            if self.probe.is_complete() && !self.pending.is_empty() {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.poll(remaining)?;
        }

        if !self.probe.is_complete() {
            return Err(TransportError::Timeout(format!(
                "no complete {} stream within {:?}",
                self.kind.name(),
                self.probe_timeout
            )));
        }
        self.probe.stream_info()
    }
}

impl PacketReader for RtmpPlayer {
    #[instrument(name = "rtmp_play_open", skip_all, fields(url = %self.url, kind = self.kind.name()))]
    fn open(&mut self) -> LinkResult<StreamInfo> {
        self.close();

        if self.runtime.is_none() {
            self.runtime = Some(build_runtime()?);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(LinkError::NotOpen);
        };

        let url = self.url.clone();
        let wait = self.connect_timeout;
        let connection = runtime.block_on(async {
            let mut connection = RtmpConnection::connect(&url, wait).await?;
            connection.play(&url.stream_key, wait).await?;
            Ok::<_, TransportError>(connection)
        })?;
        self.connection = Some(connection);

        let info = match self.probe() {
            Ok(info) => info,
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        };

        info!(
            codec = info.codec.name(),
            format = %info.format,
            buffered = self.pending.len(),
            "Playing"
        );
        Ok(info)
    }

    fn read_packet(&mut self, timeout: Duration) -> LinkResult<Incoming<EncodedPacket>> {
        if self.connection.is_none() {
            return Err(LinkError::NotOpen);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.pending.pop_front() {
                self.stats.packets_received += 1;
                return Ok(Incoming::Data(packet));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Incoming::Timeout);
            }
            match self.poll(remaining) {
                Ok(_) => self.drain_messages()?,
                Err(TransportError::ConnectionLost(reason)) => {
                    info!(reason = %reason, "Stream ended");
                    return Ok(Incoming::End);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        self.pending.clear();
        self.probe = Probe::default();
        self.inject_parameter_sets = false;

        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Some(runtime) = self.runtime.as_ref() {
            runtime.block_on(connection.shutdown());
        }
        info!(
            packets = self.stats.packets_received,
            "Disconnected from RTMP server"
        );
        self.stats = TransportStatistics::default();
    }
}

impl Drop for RtmpPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::{build_audio_tag, build_video_tag};

    const SPS: [u8; 6] = [0x67, 0x42, 0xC0, 0x1E, 0xAB, 0xCD];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn player(kind: MediaKind) -> RtmpPlayer {
        RtmpPlayer::new("rtmp://127.0.0.1/live/test", kind).unwrap()
    }

    fn avc_header() -> Bytes {
        let mut annex_b = vec![0, 0, 0, 1];
        annex_b.extend_from_slice(&SPS);
        annex_b.extend_from_slice(&[0, 0, 0, 1]);
        annex_b.extend_from_slice(&PPS);
        let config = AvcDecoderConfig::from_annex_b(&annex_b).unwrap();
        build_video_tag(&config.to_bytes(), true, true, 0)
    }

    #[test]
    fn test_aac_probe_uses_audio_specific_config() {
        let mut player = player(MediaKind::Audio);
        let format = AudioFormat::new(SampleFormat::S16, 2, 48000);
        let header = build_audio_tag(CodecId::Aac, &format, &[0x11, 0x90], true).unwrap();
        let frame = build_audio_tag(CodecId::Aac, &format, &[0x21, 0x00], false).unwrap();

        player
            .ingest(MediaMessage::Audio { data: header, timestamp: 0 })
            .unwrap();
        assert!(player.probe.is_complete());
        player
            .ingest(MediaMessage::Audio { data: frame, timestamp: 23 })
            .unwrap();

        let info = player.probe.stream_info().unwrap();
        assert_eq!(info.codec, CodecId::Aac);
        assert_eq!(info.format.as_audio().unwrap().sample_rate, 48000);
        assert_eq!(info.format.as_audio().unwrap().channels, 2);
        assert_eq!(info.extradata.as_ref(), &[0x11, 0x90]);

        let packet = player.pending.pop_front().unwrap();
        assert_eq!(packet.dts, 23);
        assert_eq!(packet.payload.as_ref(), &[0x21, 0x00]);
    }

    #[test]
    fn test_pcm_probe_prefers_metadata_rate() {
        let mut player = player(MediaKind::Audio);
        let mut metadata = StreamMetadata::new();
        metadata.audio_sample_rate = Some(48000);
        metadata.audio_channels = Some(1);
        player.ingest(MediaMessage::Metadata(metadata)).unwrap();

        let format = AudioFormat::new(SampleFormat::S16, 1, 48000);
        let tag = build_audio_tag(CodecId::Pcm, &format, &[0, 0, 1, 0], false).unwrap();
        player
            .ingest(MediaMessage::Audio { data: tag, timestamp: 0 })
            .unwrap();

        let info = player.probe.stream_info().unwrap();
        assert_eq!(info.codec, CodecId::Pcm);
        assert_eq!(info.format.as_audio().unwrap().sample_rate, 48000);
        assert_eq!(info.format.as_audio().unwrap().channels, 1);
    }

    #[test]
    fn test_video_packets_converted_to_annex_b() {
        let mut player = player(MediaKind::Video);
        player
            .ingest(MediaMessage::Video { data: avc_header(), timestamp: 0 })
            .unwrap();

        let avcc = [0, 0, 0, 2, 0x65, 0x88];
        let tag = build_video_tag(&avcc, true, false, 66);
        player
            .ingest(MediaMessage::Video { data: tag, timestamp: 100 })
            .unwrap();

        let info = player.probe.stream_info().unwrap();
        assert_eq!(info.codec, CodecId::H264);
        assert_eq!(info.format.as_video().unwrap().width, 0);
        assert!(info.extradata.starts_with(&[0, 0, 0, 1, 0x67]));

        let packet = player.pending.pop_front().unwrap();
        assert!(packet.keyframe);
        assert_eq!(packet.dts, 100);
        assert_eq!(packet.pts, 166);
        assert_eq!(packet.payload.as_ref(), &[0, 0, 0, 1, 0x65, 0x88]);
    }

    #[test]
    fn test_picture_before_sequence_header_dropped() {
        let mut player = player(MediaKind::Video);
        let tag = build_video_tag(&[0, 0, 0, 1, 0x41], false, false, 0);
        player
            .ingest(MediaMessage::Video { data: tag, timestamp: 0 })
            .unwrap();
        assert!(player.pending.is_empty());
        assert!(!player.probe.is_complete());
    }

    #[test]
    fn test_other_kind_ignored() {
        let mut player = player(MediaKind::Audio);
        player
            .ingest(MediaMessage::Video { data: avc_header(), timestamp: 0 })
            .unwrap();
        assert!(player.probe.codec.is_none());
    }

    #[test]
    fn test_read_before_open_fails() {
        let mut player = player(MediaKind::Audio);
        assert!(matches!(
            player.read_packet(Duration::from_millis(1)),
            Err(LinkError::NotOpen)
        ));
    }
}
