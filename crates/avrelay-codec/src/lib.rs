//! Encoder and decoder sessions.
//!
//! Every engine speaks the same push/pull contract: feed one input, then
//! drain outputs until [`Received::NeedMoreInput`] (or
//! [`Received::EndOfStream`] once the input side has been closed with
//! `None`). A session that answers [`SendStatus::Busy`] must be drained
//! before the same input is sent again.
//!
//! PCM is always available. AAC (`fdk-aac`), x264 (`x264`) and the FFmpeg
//! H.264 decoder (`ffmpeg`) are cargo features.

#[cfg(feature = "fdk-aac")]
mod aac;
mod error;
#[cfg(feature = "ffmpeg")]
mod h264;
mod pcm;
mod queue;
#[cfg(feature = "x264")]
mod x264;

#[cfg(feature = "fdk-aac")]
pub use aac::{AacDecoder, AacEncoder};
pub use error::CodecError;
#[cfg(feature = "ffmpeg")]
pub use h264::H264Decoder;
pub use pcm::{PcmDecoder, PcmEncoder};
#[cfg(feature = "x264")]
pub use x264::X264Encoder;

use avrelay_types::{
    CodecId, EncodedPacket, MediaFormat, MediaFrame, PipelineConfig, StreamInfo,
};
use tracing::info;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Samples per PCM packet, matched to one AAC frame.
pub const PCM_FRAME_SIZE: usize = 1024;

/// Samples per AAC-LC frame.
pub const AAC_FRAME_SIZE: usize = 1024;

/// Outputs a session holds before it answers `Busy`.
pub const MAX_PENDING_OUTPUTS: usize = 16;

/// Answer to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Input was taken.
    Accepted,

    /// Outputs must be drained before this input can be taken.
    Busy,
}

/// Answer to a receive.
#[derive(Debug)]
pub enum Received<T> {
    /// One output unit.
    Output(T),

    /// Nothing more until the next input.
    NeedMoreInput,

    /// End of stream was sent and every output has been drained.
    EndOfStream,
}

impl<T> Received<T> {
    /// Returns the output, if any.
    pub fn into_output(self) -> Option<T> {
        match self {
            Self::Output(item) => Some(item),
            _ => None,
        }
    }
}

/// Raw frames in, compressed packets out.
pub trait EncoderSession: Send {
    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Description of the produced stream, including extradata.
    fn stream_info(&self) -> &StreamInfo;

    /// Units (samples per channel, or pictures) per codec input frame.
    fn frame_size(&self) -> usize;

    /// Feed one frame, or `None` to signal end of stream.
    fn send_frame(&mut self, frame: Option<&MediaFrame>) -> CodecResult<SendStatus>;

    /// Take the next available packet.
    fn receive_packet(&mut self) -> CodecResult<Received<EncodedPacket>>;
}

/// Compressed packets in, raw frames out.
pub trait DecoderSession: Send {
    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Format of produced frames, once known.
    fn output_format(&self) -> Option<MediaFormat>;

    /// Feed one packet, or `None` to signal end of stream.
    fn send_packet(&mut self, packet: Option<&EncodedPacket>) -> CodecResult<SendStatus>;

    /// Take the next available frame.
    fn receive_frame(&mut self) -> CodecResult<Received<MediaFrame>>;
}

/// Encoder parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Codec to produce.
    pub codec: CodecId,

    /// Raw input format.
    pub format: MediaFormat,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Pictures between keyframes; zero means one second.
    pub keyframe_interval: u32,
}

impl EncoderConfig {
    /// Create a configuration with a one-second keyframe interval.
    pub fn new(codec: CodecId, format: MediaFormat, bitrate_kbps: u32) -> Self {
        Self {
            codec,
            format,
            bitrate_kbps,
            keyframe_interval: 0,
        }
    }

    /// Encoder for the target format of a publish pipeline.
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self::new(config.codec, config.target_format, config.bitrate_kbps)
    }

    /// Keyframe interval in pictures.
    pub fn gop_size(&self) -> u32 {
        match (self.keyframe_interval, self.format.as_video()) {
            (0, Some(video)) => video.fps.max(1),
            (0, None) => 1,
            (n, _) => n,
        }
    }
}

/// Decoder parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Stream as probed from the remote source.
    pub stream: StreamInfo,
}

impl DecoderConfig {
    pub fn new(stream: StreamInfo) -> Self {
        Self { stream }
    }
}

/// Codecs compiled into this build, as (codec, can encode, can decode).
pub fn available_codecs() -> Vec<(CodecId, bool, bool)> {
    vec![
        (CodecId::Pcm, true, true),
        (CodecId::Aac, cfg!(feature = "fdk-aac"), cfg!(feature = "fdk-aac")),
        (CodecId::H264, cfg!(feature = "x264"), cfg!(feature = "ffmpeg")),
    ]
}

fn check_kind(codec: CodecId, format: &MediaFormat) -> CodecResult<()> {
    if codec.kind() == format.kind() {
        Ok(())
    } else {
        Err(CodecError::Unsupported(format!(
            "{} cannot carry {}",
            codec.name(),
            format
        )))
    }
}

/// Build an encoder session.
pub fn create_encoder(config: &EncoderConfig) -> CodecResult<Box<dyn EncoderSession>> {
    check_kind(config.codec, &config.format)?;

    let encoder: Box<dyn EncoderSession> = match config.codec {
        CodecId::Pcm => Box::new(PcmEncoder::new(config)?),
        CodecId::Aac => create_aac_encoder(config)?,
        CodecId::H264 => create_h264_encoder(config)?,
    };

    info!(
        engine = encoder.name(),
        format = %config.format,
        bitrate_kbps = config.bitrate_kbps,
        "Encoder session created"
    );
    Ok(encoder)
}

/// Build a decoder session.
pub fn create_decoder(config: &DecoderConfig) -> CodecResult<Box<dyn DecoderSession>> {
    check_kind(config.stream.codec, &config.stream.format)?;

    let decoder: Box<dyn DecoderSession> = match config.stream.codec {
        CodecId::Pcm => Box::new(PcmDecoder::new(&config.stream)?),
        CodecId::Aac => create_aac_decoder(&config.stream)?,
        CodecId::H264 => create_h264_decoder(&config.stream)?,
    };

    info!(
        engine = decoder.name(),
        codec = config.stream.codec.name(),
        "Decoder session created"
    );
    Ok(decoder)
}

#[cfg(feature = "fdk-aac")]
fn create_aac_encoder(config: &EncoderConfig) -> CodecResult<Box<dyn EncoderSession>> {
    Ok(Box::new(AacEncoder::new(config)?))
}

#[cfg(not(feature = "fdk-aac"))]
fn create_aac_encoder(_config: &EncoderConfig) -> CodecResult<Box<dyn EncoderSession>> {
    Err(CodecError::Unavailable(
        "AAC encoding requires the fdk-aac feature".into(),
    ))
}

#[cfg(feature = "fdk-aac")]
fn create_aac_decoder(stream: &StreamInfo) -> CodecResult<Box<dyn DecoderSession>> {
    Ok(Box::new(AacDecoder::new(stream)?))
}

#[cfg(not(feature = "fdk-aac"))]
fn create_aac_decoder(_stream: &StreamInfo) -> CodecResult<Box<dyn DecoderSession>> {
    Err(CodecError::Unavailable(
        "AAC decoding requires the fdk-aac feature".into(),
    ))
}

#[cfg(feature = "x264")]
fn create_h264_encoder(config: &EncoderConfig) -> CodecResult<Box<dyn EncoderSession>> {
    Ok(Box::new(X264Encoder::new(config)?))
}

#[cfg(not(feature = "x264"))]
fn create_h264_encoder(_config: &EncoderConfig) -> CodecResult<Box<dyn EncoderSession>> {
    Err(CodecError::Unavailable(
        "H.264 encoding requires the x264 feature".into(),
    ))
}

#[cfg(feature = "ffmpeg")]
fn create_h264_decoder(stream: &StreamInfo) -> CodecResult<Box<dyn DecoderSession>> {
    Ok(Box::new(H264Decoder::new(stream)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn create_h264_decoder(_stream: &StreamInfo) -> CodecResult<Box<dyn DecoderSession>> {
    Err(CodecError::Unavailable(
        "H.264 decoding requires the ffmpeg feature".into(),
    ))
}
