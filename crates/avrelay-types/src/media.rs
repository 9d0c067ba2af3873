//! Raw and compressed media units carried between pipeline stages.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::time::TimeBase;
use crate::MediaResult;

/// Kind of media carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Lowercase name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Audio sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8-bit, interleaved.
    U8,

    /// Signed 16-bit little endian, interleaved.
    S16,

    /// Signed 32-bit little endian, interleaved.
    S32,

    /// 32-bit float, interleaved.
    F32,

    /// Signed 16-bit, one plane per channel.
    S16P,

    /// 32-bit float, one plane per channel.
    F32P,
}

impl SampleFormat {
    /// Size of one sample of one channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 | Self::S16P => 2,
            Self::S32 | Self::F32 | Self::F32P => 4,
        }
    }

    /// Returns true if channels are stored in separate planes.
    pub fn is_planar(self) -> bool {
        matches!(self, Self::S16P | Self::F32P)
    }

    /// Short name, matching the usual ffmpeg spelling.
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "flt",
            Self::S16P => "s16p",
            Self::F32P => "fltp",
        }
    }
}

/// Video pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, Y0 U Y1 V.
    Yuyv422,

    /// Planar 4:2:0, Y then U then V.
    Yuv420p,

    /// Semi-planar 4:2:0, Y then interleaved UV.
    Nv12,

    /// Packed 8-bit RGB.
    Rgb24,

    /// Packed 8-bit BGR.
    Bgr24,
}

impl PixelFormat {
    /// Exact byte size of one picture with the given dimensions.
    pub fn picture_size(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);

        match self {
            Self::Yuyv422 => 4 * cw * h,
            Self::Yuv420p | Self::Nv12 => w * h + 2 * cw * ch,
            Self::Rgb24 | Self::Bgr24 => 3 * w * h,
        }
    }

    /// Short name, matching the usual ffmpeg spelling.
    pub fn name(self) -> &'static str {
        match self {
            Self::Yuyv422 => "yuyv422",
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
        }
    }
}

/// Audio stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample layout.
    pub sample_format: SampleFormat,

    /// Number of channels.
    pub channels: u16,

    /// Samples per second per channel.
    pub sample_rate: u32,
}

impl AudioFormat {
    /// Create a new audio format.
    pub fn new(sample_format: SampleFormat, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_format,
            channels,
            sample_rate,
        }
    }

    /// Bytes occupied by one sample across all channels.
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }
}

/// Video stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Pixel layout.
    pub pixel_format: PixelFormat,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Frames per second.
    pub fps: u32,
}

impl VideoFormat {
    /// Create a new video format.
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32, fps: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            fps,
        }
    }

    /// Exact byte size of one picture.
    pub fn picture_size(&self) -> usize {
        self.pixel_format.picture_size(self.width, self.height)
    }
}

/// Format of a raw media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaFormat {
    Audio(AudioFormat),
    Video(VideoFormat),
}

impl MediaFormat {
    /// Media kind of this format.
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    /// Size in bytes of one unit: a sample frame for audio, a picture for video.
    pub fn unit_size(&self) -> usize {
        match self {
            Self::Audio(a) => a.bytes_per_frame(),
            Self::Video(v) => v.picture_size(),
        }
    }

    /// Exact payload size for `units` units of this format.
    pub fn byte_size(&self, units: usize) -> usize {
        self.unit_size() * units
    }

    /// Number of whole units in `bytes`, if `bytes` is an exact multiple.
    pub fn units_in(&self, bytes: usize) -> Option<usize> {
        let unit = self.unit_size();
        if unit == 0 || bytes % unit != 0 {
            return None;
        }
        Some(bytes / unit)
    }

    /// Sample rate for audio, frame rate for video.
    pub fn rate(&self) -> u32 {
        match self {
            Self::Audio(a) => a.sample_rate,
            Self::Video(v) => v.fps,
        }
    }

    /// True when every parameter is known (non-zero).
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Audio(a) => a.channels > 0 && a.sample_rate > 0,
            Self::Video(v) => v.width > 0 && v.height > 0 && v.fps > 0,
        }
    }

    /// Audio parameters, if this is an audio format.
    pub fn as_audio(&self) -> Option<&AudioFormat> {
        match self {
            Self::Audio(a) => Some(a),
            Self::Video(_) => None,
        }
    }

    /// Video parameters, if this is a video format.
    pub fn as_video(&self) -> Option<&VideoFormat> {
        match self {
            Self::Audio(_) => None,
            Self::Video(v) => Some(v),
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio(a) => write!(
                f,
                "{} {}Hz {}ch",
                a.sample_format.name(),
                a.sample_rate,
                a.channels
            ),
            Self::Video(v) => write!(
                f,
                "{} {}x{}@{}",
                v.pixel_format.name(),
                v.width,
                v.height,
                v.fps
            ),
        }
    }
}

impl From<AudioFormat> for MediaFormat {
    fn from(format: AudioFormat) -> Self {
        Self::Audio(format)
    }
}

impl From<VideoFormat> for MediaFormat {
    fn from(format: VideoFormat) -> Self {
        Self::Video(format)
    }
}

/// One unit of raw media.
///
/// The payload size always equals `format.byte_size(units)`; the constructors
/// reject anything else, so a frame never exists in a violating state.
#[derive(Debug)]
pub struct MediaFrame {
    payload: Bytes,
    format: MediaFormat,
    units: usize,
    sequence: u64,
}

impl MediaFrame {
    /// Create a frame, deriving the unit count from the payload length.
    pub fn new(payload: impl Into<Bytes>, format: MediaFormat, sequence: u64) -> MediaResult<Self> {
        let payload = payload.into();
        let units = format
            .units_in(payload.len())
            .ok_or(MediaError::PayloadSize {
                format,
                expected: format.unit_size(),
                actual: payload.len(),
            })?;

        Ok(Self {
            payload,
            format,
            units,
            sequence,
        })
    }

    /// Create a frame holding exactly `units` units.
    pub fn with_units(
        payload: impl Into<Bytes>,
        format: MediaFormat,
        units: usize,
        sequence: u64,
    ) -> MediaResult<Self> {
        let payload = payload.into();
        let expected = format.byte_size(units);
        if payload.len() != expected {
            return Err(MediaError::PayloadSize {
                format,
                expected,
                actual: payload.len(),
            });
        }

        Ok(Self {
            payload,
            format,
            units,
            sequence,
        })
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Format of the payload.
    pub fn format(&self) -> &MediaFormat {
        &self.format
    }

    /// Number of samples (audio) or pictures (video).
    pub fn units(&self) -> usize {
        self.units
    }

    /// Capture-order sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the frame holds no units.
    pub fn is_empty(&self) -> bool {
        self.units == 0
    }

    /// Give up the frame, keeping only its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Compressed codec identifiers understood by the codec and transport crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// Signed 16-bit little endian PCM.
    Pcm,

    /// AAC-LC.
    Aac,

    /// H.264 / AVC.
    H264,
}

impl CodecId {
    /// Media kind this codec carries.
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Pcm | Self::Aac => MediaKind::Audio,
            Self::H264 => MediaKind::Video,
        }
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pcm => "pcm_s16le",
            Self::Aac => "aac",
            Self::H264 => "h264",
        }
    }
}

/// Description of one elementary stream, shared by codec and transport.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Compressed codec.
    pub codec: CodecId,

    /// Raw format the codec consumes (encode) or produces (decode).
    ///
    /// Video dimensions may be zero when an ingested stream carried no
    /// metadata; they are then known only after the first decoded picture.
    pub format: MediaFormat,

    /// Time base of packet timestamps.
    pub time_base: TimeBase,

    /// Nominal bitrate in kbps (0 if unknown).
    pub bitrate_kbps: u32,

    /// Codec configuration: AAC AudioSpecificConfig, or H.264 SPS/PPS in Annex B.
    pub extradata: Bytes,
}

impl StreamInfo {
    /// Create stream info without extradata.
    pub fn new(codec: CodecId, format: MediaFormat, time_base: TimeBase) -> Self {
        Self {
            codec,
            format,
            time_base,
            bitrate_kbps: 0,
            extradata: Bytes::new(),
        }
    }
}

/// One unit of compressed bitstream.
#[derive(Debug)]
pub struct EncodedPacket {
    /// Compressed bytes.
    pub payload: Bytes,

    /// Logical stream this packet belongs to.
    pub stream_index: usize,

    /// Presentation timestamp in `time_base`.
    pub pts: i64,

    /// Decode timestamp in `time_base`.
    pub dts: i64,

    /// Time base of `pts` and `dts`.
    pub time_base: TimeBase,

    /// Whether this packet starts a random access point.
    pub keyframe: bool,
}

impl EncodedPacket {
    /// Create a packet whose decode and presentation times coincide.
    pub fn new(payload: impl Into<Bytes>, timestamp: i64, time_base: TimeBase) -> Self {
        Self {
            payload: payload.into(),
            stream_index: 0,
            pts: timestamp,
            dts: timestamp,
            time_base,
            keyframe: false,
        }
    }

    /// Mark the packet as a keyframe.
    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    /// Rescale both timestamps into another time base.
    pub fn rescale(mut self, to: TimeBase) -> Self {
        self.pts = self.time_base.rescale(self.pts, to);
        self.dts = self.time_base.rescale(self.dts, to);
        self.time_base = to;
        self
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picture_sizes() {
        assert_eq!(PixelFormat::Yuyv422.picture_size(640, 480), 640 * 480 * 2);
        assert_eq!(PixelFormat::Yuv420p.picture_size(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Nv12.picture_size(3, 3), 9 + 2 * 2 * 2);
        assert_eq!(PixelFormat::Bgr24.picture_size(4, 2), 24);
    }

    #[test]
    fn test_frame_rejects_partial_unit() {
        let format = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, 48000));
        assert!(MediaFrame::new(vec![0u8; 6], format, 0).is_err());

        let frame = MediaFrame::new(vec![0u8; 8], format, 7).unwrap();
        assert_eq!(frame.units(), 2);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn test_frame_with_units_checks_exact_size() {
        let format = MediaFormat::Video(VideoFormat::new(PixelFormat::Rgb24, 2, 2, 30));
        assert!(MediaFrame::with_units(vec![0u8; 12], format, 1, 0).is_ok());
        assert!(MediaFrame::with_units(vec![0u8; 12], format, 2, 0).is_err());
    }

    #[test]
    fn test_packet_rescale_to_millis() {
        let packet = EncodedPacket::new(vec![1u8], 48000, TimeBase::new(1, 48000))
            .rescale(TimeBase::MILLIS);
        assert_eq!(packet.pts, 1000);
        assert_eq!(packet.dts, 1000);
    }

    #[test]
    fn test_format_serde_tagging() {
        let format = MediaFormat::Audio(AudioFormat::new(SampleFormat::F32P, 2, 44100));
        let json = serde_json::to_string(&format).unwrap();
        assert!(json.contains("\"kind\":\"audio\""));
        let back: MediaFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, format);
    }
}
