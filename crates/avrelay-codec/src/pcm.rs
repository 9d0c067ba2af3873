//! Uncompressed S16LE audio.
//!
//! The encoder only re-chunks samples into fixed packets and stamps them;
//! the decoder turns packets back into frames.

use avrelay_types::{
    AudioFormat, CodecId, EncodedPacket, MediaFormat, MediaFrame, SampleFormat, StreamInfo,
    TimeBase,
};
use tracing::{debug, trace};

use crate::error::CodecError;
use crate::queue::{FrameAccumulator, OutputQueue};
use crate::{
    CodecResult, DecoderSession, EncoderConfig, EncoderSession, Received, SendStatus,
    MAX_PENDING_OUTPUTS, PCM_FRAME_SIZE,
};

fn s16_format(format: &MediaFormat) -> CodecResult<AudioFormat> {
    match format.as_audio() {
        Some(audio) if audio.sample_format == SampleFormat::S16 && format.is_complete() => {
            Ok(*audio)
        }
        _ => Err(CodecError::Unsupported(format!(
            "PCM carries packed S16 audio, not {format}"
        ))),
    }
}

/// PCM encoder emitting `PCM_FRAME_SIZE`-sample packets.
pub struct PcmEncoder {
    info: StreamInfo,
    audio: AudioFormat,
    accumulator: FrameAccumulator,
    output: OutputQueue<EncodedPacket>,
    samples_out: i64,
}

impl PcmEncoder {
    /// Create an encoder for packed S16 input.
    pub fn new(config: &EncoderConfig) -> CodecResult<Self> {
        let audio = s16_format(&config.format)?;
        let mut info = StreamInfo::new(
            CodecId::Pcm,
            config.format,
            TimeBase::per_second(audio.sample_rate),
        );
        info.bitrate_kbps = audio.sample_rate * audio.bytes_per_frame() as u32 * 8 / 1000;

        debug!(format = %config.format, "PCM encoder initialized");

        Ok(Self {
            info,
            audio,
            accumulator: FrameAccumulator::new(PCM_FRAME_SIZE * audio.bytes_per_frame()),
            output: OutputQueue::new(MAX_PENDING_OUTPUTS),
            samples_out: 0,
        })
    }

    fn emit(&mut self, payload: Vec<u8>) {
        let samples = payload.len() / self.audio.bytes_per_frame();
        let packet = EncodedPacket::new(payload, self.samples_out, self.info.time_base)
            .with_keyframe(true);
        trace!(pts = packet.pts, samples, "PCM packet");
        self.samples_out += samples as i64;
        self.output.push(packet);
    }
}

impl EncoderSession for PcmEncoder {
    fn name(&self) -> &'static str {
        "pcm_s16le"
    }

    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn frame_size(&self) -> usize {
        PCM_FRAME_SIZE
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
                while let Some(payload) = self.accumulator.next_frame() {
                    self.emit(payload);
                }
                trace!(held_bytes = self.accumulator.buffered(), "PCM frame accepted");
            }
            None => {
                if let Some(tail) = self.accumulator.take_tail() {
                    self.emit(tail);
                }
                self.output.finish();
                debug!(samples = self.samples_out, "PCM encoder flushed");
            }
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_packet(&mut self) -> CodecResult<Received<EncodedPacket>> {
        Ok(self.output.pop())
    }
}

/// PCM decoder producing one frame per packet.
pub struct PcmDecoder {
    format: MediaFormat,
    output: OutputQueue<MediaFrame>,
    sequence: u64,
}

impl PcmDecoder {
    /// Create a decoder for the probed stream.
    pub fn new(stream: &StreamInfo) -> CodecResult<Self> {
        s16_format(&stream.format)?;
        Ok(Self {
            format: stream.format,
            output: OutputQueue::new(MAX_PENDING_OUTPUTS),
            sequence: 0,
        })
    }
}

impl DecoderSession for PcmDecoder {
    fn name(&self) -> &'static str {
        "pcm_s16le"
    }

    fn output_format(&self) -> Option<MediaFormat> {
        Some(self.format)
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
            Some(packet) => {
                let frame = MediaFrame::new(packet.payload.clone(), self.format, self.sequence)
                    .map_err(|e| CodecError::Decoding(e.to_string()))?;
                self.sequence += 1;
                self.output.push(frame);
            }
            None => self.output.finish(),
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> CodecResult<Received<MediaFrame>> {
        Ok(self.output.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> MediaFormat {
        MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, 48000))
    }

    fn drain(encoder: &mut PcmEncoder) -> Vec<EncodedPacket> {
        let mut packets = Vec::new();
        while let Received::Output(packet) = encoder.receive_packet().unwrap() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_encoder_chunks_and_stamps_by_sample_count() {
        let mut encoder = PcmEncoder::new(&EncoderConfig::new(CodecId::Pcm, stereo(), 0)).unwrap();
        assert_eq!(encoder.stream_info().time_base, TimeBase::per_second(48000));

        // 1500 samples: one full packet, 476 held back.
        let frame = MediaFrame::with_units(vec![0u8; 1500 * 4], stereo(), 1500, 0).unwrap();
        assert_eq!(encoder.send_frame(Some(&frame)).unwrap(), SendStatus::Accepted);
        let packets = drain(&mut encoder);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 0);
        assert_eq!(packets[0].len(), 1024 * 4);

        let frame = MediaFrame::with_units(vec![0u8; 600 * 4], stereo(), 600, 1).unwrap();
        encoder.send_frame(Some(&frame)).unwrap();
        let packets = drain(&mut encoder);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 1024);

        // Tail of 52 samples is released at end of stream.
        encoder.send_frame(None).unwrap();
        let packets = drain(&mut encoder);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 2048);
        assert_eq!(packets[0].len(), 52 * 4);
        assert!(matches!(
            encoder.receive_packet().unwrap(),
            Received::EndOfStream
        ));
    }

    #[test]
    fn test_encoder_rejects_foreign_format() {
        let mut encoder = PcmEncoder::new(&EncoderConfig::new(CodecId::Pcm, stereo(), 0)).unwrap();
        let mono = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 1, 48000));
        let frame = MediaFrame::new(vec![0u8; 8], mono, 0).unwrap();

        let err = encoder.send_frame(Some(&frame)).unwrap_err();
        assert!(err.is_unit());
    }

    #[test]
    fn test_float_input_is_unsupported() {
        let float = MediaFormat::Audio(AudioFormat::new(SampleFormat::F32, 2, 48000));
        let err = PcmEncoder::new(&EncoderConfig::new(CodecId::Pcm, float, 0))
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_busy_until_drained() {
        let mut encoder = PcmEncoder::new(&EncoderConfig::new(CodecId::Pcm, stereo(), 0)).unwrap();
        let big = MediaFrame::with_units(
            vec![0u8; MAX_PENDING_OUTPUTS * 1024 * 4],
            stereo(),
            MAX_PENDING_OUTPUTS * 1024,
            0,
        )
        .unwrap();
        encoder.send_frame(Some(&big)).unwrap();

        let small = MediaFrame::with_units(vec![0u8; 4], stereo(), 1, 1).unwrap();
        assert_eq!(encoder.send_frame(Some(&small)).unwrap(), SendStatus::Busy);
        assert_eq!(drain(&mut encoder).len(), MAX_PENDING_OUTPUTS);
        assert_eq!(encoder.send_frame(Some(&small)).unwrap(), SendStatus::Accepted);
    }

    #[test]
    fn test_send_after_end_fails() {
        let mut encoder = PcmEncoder::new(&EncoderConfig::new(CodecId::Pcm, stereo(), 0)).unwrap();
        encoder.send_frame(None).unwrap();
        assert!(matches!(
            encoder.send_frame(None),
            Err(CodecError::Finished)
        ));
    }

    #[test]
    fn test_decoder_rejects_partial_sample() {
        let stream = StreamInfo::new(CodecId::Pcm, stereo(), TimeBase::per_second(48000));
        let mut decoder = PcmDecoder::new(&stream).unwrap();

        let bad = EncodedPacket::new(vec![0u8; 6], 0, stream.time_base);
        assert!(decoder.send_packet(Some(&bad)).unwrap_err().is_unit());

        let good = EncodedPacket::new(vec![0u8; 8], 0, stream.time_base);
        decoder.send_packet(Some(&good)).unwrap();
        let Received::Output(frame) = decoder.receive_frame().unwrap() else {
            panic!("no frame");
        };
        assert_eq!(frame.units(), 2);
        assert!(matches!(
            decoder.receive_frame().unwrap(),
            Received::NeedMoreInput
        ));

        decoder.send_packet(None).unwrap();
        assert!(matches!(
            decoder.receive_frame().unwrap(),
            Received::EndOfStream
        ));
    }
}
