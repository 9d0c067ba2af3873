//! FLV audio and video tag bodies as carried in RTMP messages.

use avrelay_types::{AudioFormat, CodecId, SampleFormat};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::TransportResult;

/// SoundFormat for little-endian linear PCM.
pub const SOUND_FORMAT_PCM_LE: u8 = 3;

/// SoundFormat for AAC.
pub const SOUND_FORMAT_AAC: u8 = 10;

/// CodecID for AVC.
pub const VIDEO_CODEC_AVC: u8 = 7;

/// Sampling frequencies indexed by the AudioSpecificConfig frequency index.
const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Rates selectable by the two SoundRate bits.
const FLV_SAMPLE_RATES: [u32; 4] = [5512, 11025, 22050, 44100];

/// A parsed audio tag body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTag {
    pub codec: CodecId,

    /// Sample rate from the header bits (coarse; AAC always reports 44100).
    pub sample_rate: u32,

    /// Channel count from the header bit.
    pub channels: u16,

    /// AAC AudioSpecificConfig rather than an access unit.
    pub sequence_header: bool,

    pub data: Bytes,
}

/// A parsed AVC video tag body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTag {
    pub keyframe: bool,

    /// AVC decoder configuration record rather than NAL units.
    pub sequence_header: bool,

    /// End-of-sequence marker.
    pub end_of_sequence: bool,

    /// Presentation offset from the tag timestamp, in milliseconds.
    pub composition_time: i32,

    pub data: Bytes,
}

fn sound_rate_bits(sample_rate: u32) -> u8 {
    FLV_SAMPLE_RATES
        .iter()
        .rposition(|&rate| sample_rate >= rate)
        .unwrap_or(0) as u8
}

/// Build an audio tag body.
///
/// AAC always declares 44 kHz stereo in the header; the real parameters live
/// in the AudioSpecificConfig. PCM declares the nearest FLV rate and relies
/// on stream metadata for the exact one.
pub fn build_audio_tag(
    codec: CodecId,
    format: &AudioFormat,
    data: &[u8],
    sequence_header: bool,
) -> TransportResult<Bytes> {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    match codec {
        CodecId::Aac => {
            buf.put_u8(SOUND_FORMAT_AAC << 4 | 0x0F);
            buf.put_u8(if sequence_header { 0x00 } else { 0x01 });
        }
        CodecId::Pcm => {
            if format.sample_format != SampleFormat::S16 {
                return Err(TransportError::Unsupported(format!(
                    "FLV PCM carries 16-bit samples, not {}",
                    format.sample_format.name()
                )));
            }
            let stereo = u8::from(format.channels > 1);
            buf.put_u8(SOUND_FORMAT_PCM_LE << 4 | sound_rate_bits(format.sample_rate) << 2 | 0x02 | stereo);
        }
        CodecId::H264 => {
            return Err(TransportError::Unsupported("H.264 in an audio tag".into()));
        }
    }
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Parse an audio tag body.
pub fn parse_audio_tag(body: &Bytes) -> TransportResult<AudioTag> {
    let header = *body
        .first()
        .ok_or_else(|| TransportError::Protocol("empty audio tag".into()))?;

    let sample_rate = FLV_SAMPLE_RATES[((header >> 2) & 0x03) as usize];
    let channels = if header & 0x01 == 1 { 2 } else { 1 };

    match header >> 4 {
        SOUND_FORMAT_AAC => {
            let packet_type = *body
                .get(1)
                .ok_or_else(|| TransportError::Protocol("truncated AAC tag".into()))?;
            Ok(AudioTag {
                codec: CodecId::Aac,
                sample_rate,
                channels,
                sequence_header: packet_type == 0,
                data: body.slice(2..),
            })
        }
        SOUND_FORMAT_PCM_LE => {
            if header & 0x02 == 0 {
                return Err(TransportError::Unsupported("8-bit PCM audio".into()));
            }
            Ok(AudioTag {
                codec: CodecId::Pcm,
                sample_rate,
                channels,
                sequence_header: false,
                data: body.slice(1..),
            })
        }
        other => Err(TransportError::Unsupported(format!(
            "FLV sound format {other}"
        ))),
    }
}

/// Build an AVC video tag body.
pub fn build_video_tag(
    data: &[u8],
    keyframe: bool,
    sequence_header: bool,
    composition_time: i32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());

    let frame_type = if keyframe { 0x10 } else { 0x20 };
    buf.put_u8(frame_type | VIDEO_CODEC_AVC);
    buf.put_u8(if sequence_header { 0x00 } else { 0x01 });

    // Composition time, 24-bit signed big endian.
    let ct = composition_time as u32;
    buf.put_u8((ct >> 16) as u8);
    buf.put_u8((ct >> 8) as u8);
    buf.put_u8(ct as u8);

    buf.put_slice(data);
    buf.freeze()
}

/// Parse a video tag body. Only AVC is accepted.
pub fn parse_video_tag(body: &Bytes) -> TransportResult<VideoTag> {
    if body.len() < 5 {
        return Err(TransportError::Protocol(format!(
            "video tag of {} bytes",
            body.len()
        )));
    }

    let codec = body[0] & 0x0F;
    if codec != VIDEO_CODEC_AVC {
        return Err(TransportError::Unsupported(format!("FLV video codec {codec}")));
    }

    let raw = (body[2] as u32) << 16 | (body[3] as u32) << 8 | body[4] as u32;
    // Sign-extend from 24 bits.
    let composition_time = ((raw << 8) as i32) >> 8;

    Ok(VideoTag {
        keyframe: body[0] >> 4 == 1,
        sequence_header: body[1] == 0,
        end_of_sequence: body[1] == 2,
        composition_time,
        data: body.slice(5..),
    })
}

/// Sample rate and channel count from an AAC AudioSpecificConfig.
pub fn parse_audio_specific_config(config: &[u8]) -> TransportResult<(u32, u16)> {
    if config.len() < 2 {
        return Err(TransportError::Protocol(
            "AudioSpecificConfig shorter than two bytes".into(),
        ));
    }

    let freq_index = ((config[0] & 0x07) << 1 | config[1] >> 7) as usize;
    let channels = ((config[1] >> 3) & 0x0F) as u16;

    let sample_rate = match AAC_SAMPLE_RATES.get(freq_index) {
        Some(rate) => *rate,
        // Index 15 carries an explicit 24-bit rate.
        None if freq_index == 15 && config.len() >= 5 => {
            ((config[1] as u32 & 0x7F) << 17)
                | (config[2] as u32) << 9
                | (config[3] as u32) << 1
                | (config[4] as u32) >> 7
        }
        None => {
            return Err(TransportError::Protocol(format!(
                "AAC frequency index {freq_index}"
            )))
        }
    };

    if channels == 0 {
        return Err(TransportError::Unsupported(
            "AAC channel configuration in program config element".into(),
        ));
    }
    Ok((sample_rate, channels))
}
