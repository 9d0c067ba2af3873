//! AAC-LC encoding and decoding through fdk-aac.

use avrelay_types::{
    AudioFormat, CodecId, EncodedPacket, MediaFormat, MediaFrame, SampleFormat, StreamInfo,
    TimeBase,
};
use bytes::Bytes;
use fdk_aac::dec::{Decoder, Transport as DecoderTransport};
use fdk_aac::enc::{BitRate, ChannelMode, Encoder, EncoderParams, Transport};
use tracing::{debug, instrument, trace, warn};

use crate::error::CodecError;
use crate::queue::{FrameAccumulator, OutputQueue};
use crate::{
    CodecResult, DecoderSession, EncoderConfig, EncoderSession, Received, SendStatus,
    AAC_FRAME_SIZE, MAX_PENDING_OUTPUTS,
};

/// Decoder scratch: one frame of up to eight channels.
const MAX_DECODED_SAMPLES: usize = 2048 * 8;

fn to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// AAC-LC encoder producing raw access units.
pub struct AacEncoder {
    encoder: Encoder,
    info: StreamInfo,
    audio: AudioFormat,
    accumulator: FrameAccumulator,
    output_buffer: Vec<u8>,
    output: OutputQueue<EncodedPacket>,
    frames_out: i64,
}

impl AacEncoder {
    /// Create an encoder for packed S16 mono or stereo input.
    #[instrument(name = "aac_new", skip_all)]
    pub fn new(config: &EncoderConfig) -> CodecResult<Self> {
        let audio = match config.format.as_audio() {
            Some(audio) if audio.sample_format == SampleFormat::S16 => *audio,
            _ => {
                return Err(CodecError::Unsupported(format!(
                    "AAC encodes packed S16 audio, not {}",
                    config.format
                )))
            }
        };

        let channels = match audio.channels {
            1 => ChannelMode::Mono,
            2 => ChannelMode::Stereo,
            n => {
                return Err(CodecError::Unsupported(format!(
                    "AAC encoder supports 1 or 2 channels, not {n}"
                )))
            }
        };

        debug!(
            sample_rate = audio.sample_rate,
            channels = audio.channels,
            bitrate_kbps = config.bitrate_kbps,
            "Initializing AAC encoder"
        );

        let params = EncoderParams {
            bit_rate: BitRate::Cbr(config.bitrate_kbps * 1000),
            sample_rate: audio.sample_rate,
            transport: Transport::Raw,
            channels,
        };

        let encoder = Encoder::new(params)
            .map_err(|e| CodecError::Initialization(format!("fdk-aac init failed: {:?}", e)))?;
        let encoder_info = encoder
            .info()
            .map_err(|e| CodecError::Initialization(format!("fdk-aac info failed: {:?}", e)))?;

        let conf_size = (encoder_info.confSize as usize).min(encoder_info.confBuf.len());
        let mut info = StreamInfo::new(
            CodecId::Aac,
            config.format,
            TimeBase::per_second(audio.sample_rate),
        );
        info.bitrate_kbps = config.bitrate_kbps;
        info.extradata = Bytes::copy_from_slice(&encoder_info.confBuf[..conf_size]);

        debug!(
            max_out_buf_bytes = encoder_info.maxOutBufBytes,
            frame_length = encoder_info.frameLength,
            config_bytes = conf_size,
            "AAC encoder initialized"
        );

        Ok(Self {
            encoder,
            info,
            audio,
            accumulator: FrameAccumulator::new(AAC_FRAME_SIZE * audio.bytes_per_frame()),
            output_buffer: vec![0u8; encoder_info.maxOutBufBytes as usize],
            output: OutputQueue::new(MAX_PENDING_OUTPUTS),
            frames_out: 0,
        })
    }

    fn encode_frame(&mut self, pcm: &[u8]) -> CodecResult<()> {
        let samples = to_i16(pcm);
        let encode_info = self
            .encoder
            .encode(&samples, &mut self.output_buffer)
            .map_err(|e| CodecError::Encoding(format!("AAC encode failed: {:?}", e)))?;

        // Nothing out while the encoder fills its lookahead.
        if encode_info.output_size == 0 {
            return Ok(());
        }

        let pts = self.frames_out * AAC_FRAME_SIZE as i64;
        trace!(pts, size = encode_info.output_size, "AAC frame");
        let packet = EncodedPacket::new(
            Bytes::copy_from_slice(&self.output_buffer[..encode_info.output_size]),
            pts,
            self.info.time_base,
        )
        .with_keyframe(true);

        self.frames_out += 1;
        self.output.push(packet);
        Ok(())
    }
}

impl EncoderSession for AacEncoder {
    fn name(&self) -> &'static str {
        "AAC-LC"
    }

    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn frame_size(&self) -> usize {
        AAC_FRAME_SIZE
    }

    fn send_frame(&mut self, frame: Option<&MediaFrame>) -> CodecResult<SendStatus> {
        if self.output.is_finished() {
            return Err(CodecError::Finished);
        }
        if self.output.is_full() {
            return Ok(SendStatus::Busy);
        }

        match frame {
            Some(frame) => {
                if *frame.format() != self.info.format {
                    return Err(CodecError::InvalidInput(format!(
                        "expected {}, got {}",
                        self.info.format,
                        frame.format()
                    )));
                }
                self.accumulator.extend(frame.payload());
                while let Some(pcm) = self.accumulator.next_frame() {
                    self.encode_frame(&pcm)?;
                }
            }
            None => {
                debug!("Flushing AAC encoder");
                if let Some(mut tail) = self.accumulator.take_tail() {
                    // Pad with silence to reach a full frame.
                    tail.resize(AAC_FRAME_SIZE * self.audio.bytes_per_frame(), 0);
                    if let Err(e) = self.encode_frame(&tail) {
                        warn!("Dropping AAC tail: {}", e);
                    }
                }
                self.output.finish();
            }
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_packet(&mut self) -> CodecResult<Received<EncodedPacket>> {
        Ok(self.output.pop())
    }
}

/// AAC decoder configured from the stream's AudioSpecificConfig.
pub struct AacDecoder {
    decoder: Decoder,
    format: Option<MediaFormat>,
    pcm: Vec<i16>,
    output: OutputQueue<MediaFrame>,
    sequence: u64,
}

impl AacDecoder {
    /// Create a decoder for the probed stream.
    #[instrument(name = "aac_decoder_new", skip_all)]
    pub fn new(stream: &StreamInfo) -> CodecResult<Self> {
        if stream.extradata.is_empty() {
            return Err(CodecError::Initialization(
                "AAC stream carried no AudioSpecificConfig".into(),
            ));
        }

        let mut decoder = Decoder::new(DecoderTransport::Raw);
        decoder
            .config_raw(&stream.extradata)
            .map_err(|e| CodecError::Initialization(format!("fdk-aac config failed: {:?}", e)))?;

        debug!(config_bytes = stream.extradata.len(), "AAC decoder initialized");

        Ok(Self {
            decoder,
            format: stream.format.is_complete().then_some(stream.format),
            pcm: vec![0i16; MAX_DECODED_SAMPLES],
            output: OutputQueue::new(MAX_PENDING_OUTPUTS),
            sequence: 0,
        })
    }

    fn decode(&mut self, payload: &[u8]) -> CodecResult<()> {
        let mut offset = 0;
        while offset < payload.len() {
            let consumed = self
                .decoder
                .fill(&payload[offset..])
                .map_err(|e| CodecError::Decoding(format!("AAC fill failed: {:?}", e)))?;
            if consumed == 0 {
                break;
            }
            offset += consumed;
        }

        let mut decoded = 0;
        while let Ok(()) = self.decoder.decode_frame(&mut self.pcm) {
            let info = self.decoder.stream_info();
            let format = MediaFormat::Audio(AudioFormat::new(
                SampleFormat::S16,
                info.numChannels.max(1) as u16,
                info.sampleRate.max(1) as u32,
            ));
            let samples = self.decoder.decoded_frame_size().min(self.pcm.len());
            let bytes: Vec<u8> = self.pcm[..samples]
                .iter()
                .flat_map(|s| s.to_le_bytes())
                .collect();

            let frame = MediaFrame::new(bytes, format, self.sequence)?;
            self.format = Some(format);
            self.sequence += 1;
            self.output.push(frame);
            decoded += 1;
        }

        if decoded == 0 {
            return Err(CodecError::Decoding("AAC access unit produced no audio".into()));
        }
        Ok(())
    }
}

impl DecoderSession for AacDecoder {
    fn name(&self) -> &'static str {
        "AAC-LC"
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.format
    }

    fn send_packet(&mut self, packet: Option<&EncodedPacket>) -> CodecResult<SendStatus> {
        if self.output.is_finished() {
            return Err(CodecError::Finished);
        }
        if self.output.is_full() {
            return Ok(SendStatus::Busy);
        }

        match packet {
            Some(packet) if packet.is_empty() => {}
            Some(packet) => self.decode(&packet.payload)?,
            None => self.output.finish(),
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> CodecResult<Received<MediaFrame>> {
        Ok(self.output.pop())
    }
}

// SAFETY: the fdk-aac handles are plain heap state owned by one session and
// only touched from the thread currently driving it.
unsafe impl Send for AacEncoder {}
unsafe impl Send for AacDecoder {}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> MediaFormat {
        MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, 48000))
    }

    #[test]
    fn test_encoder_reports_audio_specific_config() {
        let encoder = AacEncoder::new(&EncoderConfig::new(CodecId::Aac, stereo(), 128)).unwrap();
        let info = encoder.stream_info();
        assert_eq!(info.codec, CodecId::Aac);
        assert_eq!(info.time_base, TimeBase::per_second(48000));
        // AAC-LC, 48 kHz, stereo.
        assert_eq!(&info.extradata[..2], &[0x11, 0x90]);
    }

    #[test]
    fn test_encode_decode_restores_format() {
        let mut encoder =
            AacEncoder::new(&EncoderConfig::new(CodecId::Aac, stereo(), 128)).unwrap();
        let mut decoder = AacDecoder::new(encoder.stream_info()).unwrap();

        let frame = MediaFrame::with_units(vec![0u8; 4096 * 4], stereo(), 4096, 0).unwrap();
        encoder.send_frame(Some(&frame)).unwrap();
        encoder.send_frame(None).unwrap();

        let mut decoded = 0;
        let mut last_pts = -1;
        while let Received::Output(packet) = encoder.receive_packet().unwrap() {
            assert!(packet.pts > last_pts);
            last_pts = packet.pts;
            decoder.send_packet(Some(&packet)).unwrap();
            while let Received::Output(frame) = decoder.receive_frame().unwrap() {
                assert_eq!(*frame.format(), stereo());
                decoded += 1;
            }
        }
        assert!(decoded > 0);
    }

    #[test]
    fn test_six_channels_unsupported() {
        let surround = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 6, 48000));
        let err = AacEncoder::new(&EncoderConfig::new(CodecId::Aac, surround, 128))
            .err()
            .unwrap();
        assert!(err.is_config());
    }
}
