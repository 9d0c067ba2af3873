//! RTMP publishing link.

use std::time::Duration;

use avrelay_types::{
    CodecId, EncodedPacket, LinkError, LinkResult, MediaFormat, PacketWriter, StreamInfo,
    TimeBase,
};
use bytes::Bytes;
use rml_rtmp::sessions::StreamMetadata;
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::{RtmpConnection, RtmpUrl};
use crate::error::TransportError;
use crate::flv::{
    build_audio_tag, build_video_tag, SOUND_FORMAT_AAC, SOUND_FORMAT_PCM_LE, VIDEO_CODEC_AVC,
};
use crate::nal::{annex_b_to_avcc, AvcDecoderConfig};
use crate::{build_runtime, TransportResult, TransportStatistics, CONNECT_TIMEOUT_MS};

/// `onMetaData` for the stream being published.
pub fn stream_metadata(info: &StreamInfo) -> StreamMetadata {
    let mut metadata = StreamMetadata::new();
    metadata.encoder = Some(format!("avrelay {}", env!("CARGO_PKG_VERSION")));

    match &info.format {
        MediaFormat::Video(video) => {
            metadata.video_width = Some(video.width);
            metadata.video_height = Some(video.height);
            metadata.video_frame_rate = Some(video.fps as f32);
            metadata.video_codec_id = Some(VIDEO_CODEC_AVC as u32);
            metadata.video_bitrate_kbps = Some(info.bitrate_kbps);
        }
        MediaFormat::Audio(audio) => {
            metadata.audio_sample_rate = Some(audio.sample_rate);
            metadata.audio_channels = Some(audio.channels as u32);
            metadata.audio_is_stereo = Some(audio.channels > 1);
            metadata.audio_codec_id = Some(match info.codec {
                CodecId::Aac => SOUND_FORMAT_AAC,
                _ => SOUND_FORMAT_PCM_LE,
            } as u32);
            metadata.audio_bitrate_kbps = Some(info.bitrate_kbps);
        }
    }
    metadata
}

/// Publishes one elementary stream to an RTMP server.
pub struct RtmpPublisher {
    url: RtmpUrl,
    connect_timeout: Duration,
    runtime: Option<Runtime>,
    connection: Option<RtmpConnection>,
    stream: Option<StreamInfo>,
    video_header_sent: bool,
    stats: TransportStatistics,
}

impl RtmpPublisher {
    /// Create a publisher. Fails only on a malformed URL.
    pub fn new(url: &str) -> TransportResult<Self> {
        Ok(Self {
            url: RtmpUrl::parse(url)?,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            runtime: None,
            connection: None,
            stream: None,
            video_header_sent: false,
            stats: TransportStatistics::default(),
        })
    }

    /// Bound on each connect, handshake and request step.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Counters for the current connection.
    pub fn statistics(&self) -> TransportStatistics {
        self.stats.clone()
    }

    fn send(&mut self, video: bool, tag: Bytes, timestamp: u32, droppable: bool) -> TransportResult<()> {
        let (Some(runtime), Some(connection)) = (self.runtime.as_ref(), self.connection.as_mut())
        else {
            return Err(TransportError::NotConnected);
        };
        runtime.block_on(connection.send_media(video, tag, timestamp, droppable))
    }

    /// Consume acknowledgements and pings without waiting; this is also
    /// where a server-side close surfaces.
    fn drain_incoming(&mut self) -> TransportResult<()> {
        let (Some(runtime), Some(connection)) = (self.runtime.as_ref(), self.connection.as_mut())
        else {
            return Err(TransportError::NotConnected);
        };
        runtime.block_on(connection.poll(Duration::ZERO))?;
        Ok(())
    }

    fn send_video_header(&mut self, annex_b: &[u8]) -> TransportResult<bool> {
        let Some(config) = AvcDecoderConfig::from_annex_b(annex_b) else {
            return Ok(false);
        };
        let tag = build_video_tag(&config.to_bytes(), true, true, 0);
        self.send(true, tag, 0, false)?;
        debug!(
            profile = config.profile,
            level = config.level,
            "AVC sequence header sent"
        );
        Ok(true)
    }

    fn write_video(&mut self, packet: &EncodedPacket, timestamp: u32) -> TransportResult<()> {
        if !self.video_header_sent {
            // Fall back to parameter sets carried in-band on a keyframe.
            self.video_header_sent = self.send_video_header(&packet.payload)?;
            if !self.video_header_sent {
                trace!(dts = packet.dts, "Skipping picture before sequence header");
                return Ok(());
            }
        }

        let avcc = annex_b_to_avcc(&packet.payload);
        if avcc.is_empty() {
            return Ok(());
        }

        let offset = packet
            .time_base
            .rescale(packet.pts - packet.dts, TimeBase::MILLIS) as i32;
        let tag = build_video_tag(&avcc, packet.keyframe, false, offset);
        let droppable = !packet.keyframe;
        self.send(true, tag, timestamp, droppable)
    }

    fn write_audio(
        &mut self,
        info: &StreamInfo,
        packet: &EncodedPacket,
        timestamp: u32,
    ) -> TransportResult<()> {
        let format = info
            .format
            .as_audio()
            .ok_or_else(|| TransportError::Unsupported("audio packet on a video stream".into()))?;
        let tag = build_audio_tag(info.codec, format, &packet.payload, false)?;
        self.send(false, tag, timestamp, false)
    }
}

impl PacketWriter for RtmpPublisher {
    #[instrument(name = "rtmp_publish_open", skip_all, fields(url = %self.url))]
    fn open(&mut self, info: &StreamInfo) -> LinkResult<()> {
        self.close();

        if self.runtime.is_none() {
            self.runtime = Some(build_runtime()?);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(LinkError::NotOpen);
        };

        let url = self.url.clone();
        let wait = self.connect_timeout;
        let metadata = stream_metadata(info);
        let connection = runtime.block_on(async {
            let mut connection = RtmpConnection::connect(&url, wait).await?;
            connection.publish(&url.stream_key, wait).await?;
            connection.send_metadata(&metadata).await?;
            Ok::<_, TransportError>(connection)
        })?;

        self.connection = Some(connection);
        self.stream = Some(info.clone());
        self.video_header_sent = false;
        self.stats = TransportStatistics::default();

        match info.codec {
            CodecId::Aac => {
                let format = info.format.as_audio().ok_or_else(|| {
                    LinkError::Protocol("AAC stream without an audio format".into())
                })?;
                let tag = build_audio_tag(CodecId::Aac, format, &info.extradata, true)?;
                self.send(false, tag, 0, false)?;
                debug!(config_bytes = info.extradata.len(), "AAC sequence header sent");
            }
            CodecId::H264 => {
                self.video_header_sent = self.send_video_header(&info.extradata)?;
                if !self.video_header_sent {
                    warn!("Encoder gave no parameter sets; waiting for an in-band keyframe");
                }
            }
            CodecId::Pcm => {}
        }

        info!(codec = info.codec.name(), format = %info.format, "Publishing");
        Ok(())
    }

    fn write_packet(&mut self, packet: &EncodedPacket) -> LinkResult<()> {
        let info = self.stream.clone().ok_or(LinkError::NotOpen)?;
        let timestamp = packet
            .time_base
            .rescale(packet.dts, TimeBase::MILLIS)
            .clamp(0, u32::MAX as i64) as u32;

        if info.codec == CodecId::H264 {
            self.write_video(packet, timestamp)?;
        } else {
            self.write_audio(&info, packet, timestamp)?;
        }

        self.drain_incoming()?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent = self
            .connection
            .as_ref()
            .map_or(self.stats.bytes_sent, RtmpConnection::bytes_sent);
        Ok(())
    }

    fn finish(&mut self) -> LinkResult<()> {
        let (Some(runtime), Some(connection)) = (self.runtime.as_ref(), self.connection.as_mut())
        else {
            return Ok(());
        };
        runtime.block_on(connection.stop_publishing())?;
        debug!("Unpublished stream");
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Some(runtime) = self.runtime.as_ref() {
            runtime.block_on(connection.shutdown());
        }
        info!(
            packets = self.stats.packets_sent,
            bytes = self.stats.bytes_sent,
            "Disconnected from RTMP server"
        );
    }
}

impl Drop for RtmpPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bytes of an encoder's parameter sets, exposed for diagnostics.
pub fn sequence_header(info: &StreamInfo) -> Option<Bytes> {
    match info.codec {
        CodecId::H264 => AvcDecoderConfig::from_annex_b(&info.extradata).map(|c| c.to_bytes()),
        CodecId::Aac if !info.extradata.is_empty() => Some(info.extradata.clone()),
        _ => None,
    }
}
