//! H.264 decoding through FFmpeg.

use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame};
use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase as FfTimeBase, Timestamp};
use avrelay_types::{EncodedPacket, MediaFormat, MediaFrame, PixelFormat, StreamInfo, VideoFormat};
use tracing::{debug, instrument, trace};

use crate::error::CodecError;
use crate::queue::OutputQueue;
use crate::{CodecResult, DecoderSession, Received, SendStatus, MAX_PENDING_OUTPUTS};

/// Frame rate assumed when the stream did not announce one.
const FALLBACK_FPS: u32 = 30;

/// H.264 decoder producing packed yuv420p pictures.
pub struct H264Decoder {
    decoder: VideoDecoder,
    time_base: FfTimeBase,
    extradata: Option<Vec<u8>>,
    fps: u32,
    format: Option<MediaFormat>,
    output: OutputQueue<MediaFrame>,
    sequence: u64,
}

impl H264Decoder {
    /// Create a decoder for the probed stream.
    #[instrument(name = "h264_decoder_new", skip_all)]
    pub fn new(stream: &StreamInfo) -> CodecResult<Self> {
        let time_base = FfTimeBase::new(stream.time_base.num as i32, stream.time_base.den as i32);
        let decoder = VideoDecoder::builder("h264")
            .and_then(|builder| builder.time_base(time_base).build())
            .map_err(|e| CodecError::Initialization(format!("FFmpeg h264 decoder: {}", e)))?;

        let fps = stream
            .format
            .as_video()
            .map(|v| v.fps)
            .filter(|fps| *fps > 0)
            .unwrap_or(FALLBACK_FPS);

        debug!(fps, extradata = stream.extradata.len(), "H.264 decoder initialized");

        Ok(Self {
            decoder,
            time_base,
            extradata: (!stream.extradata.is_empty()).then(|| stream.extradata.to_vec()),
            fps,
            format: stream.format.is_complete().then_some(stream.format),
            output: OutputQueue::new(MAX_PENDING_OUTPUTS),
            sequence: 0,
        })
    }

    fn take_frames(&mut self) -> CodecResult<()> {
        while let Some(frame) = self
            .decoder
            .take()
            .map_err(|e| CodecError::Decoding(format!("FFmpeg take failed: {}", e)))?
        {
            let picture = self.pack(&frame)?;
            self.output.push(picture);
        }
        Ok(())
    }

    /// Copy the decoded planes into one contiguous buffer, dropping stride padding.
    fn pack(&mut self, frame: &VideoFrame) -> CodecResult<MediaFrame> {
        if frame.pixel_format() != get_pixel_format("yuv420p") {
            return Err(CodecError::Decoding(
                "decoder produced a pixel format other than yuv420p".into(),
            ));
        }

        let (w, h) = (frame.width(), frame.height());
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let planes = frame.planes();
        let mut packed = Vec::with_capacity(w * h + 2 * cw * ch);

        for (index, (width, height)) in [(w, h), (cw, ch), (cw, ch)].into_iter().enumerate() {
            let plane = &planes[index];
            let (data, stride) = (plane.data(), plane.line_size());
            for row in 0..height {
                let start = row * stride;
                let line = data.get(start..start + width).ok_or_else(|| {
                    CodecError::Decoding(format!("plane {index} shorter than {width}x{height}"))
                })?;
                packed.extend_from_slice(line);
            }
        }

        let format = MediaFormat::Video(VideoFormat::new(
            PixelFormat::Yuv420p,
            w as u32,
            h as u32,
            self.fps,
        ));
        if self.format != Some(format) {
            debug!(format = %format, "Decoded picture format");
            self.format = Some(format);
        }

        let picture = MediaFrame::with_units(packed, format, 1, self.sequence)?;
        trace!(sequence = self.sequence, "Decoded picture");
        self.sequence += 1;
        Ok(picture)
    }
}

impl DecoderSession for H264Decoder {
    fn name(&self) -> &'static str {
        "ffmpeg-h264"
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

        let Some(packet) = packet else {
            self.decoder
                .flush()
                .map_err(|e| CodecError::Decoding(format!("FFmpeg flush failed: {}", e)))?;
            self.take_frames()?;
            self.output.finish();
            return Ok(SendStatus::Accepted);
        };

        if packet.is_empty() {
            return Ok(SendStatus::Accepted);
        }

        // Parameter sets ride in front of the first access unit.
        let mut data = self.extradata.take().unwrap_or_default();
        data.extend_from_slice(&packet.payload);

        let ff_packet = PacketMut::from(data.as_slice())
            .with_pts(Timestamp::new(packet.pts, self.time_base))
            .freeze();

        match self.decoder.try_push(ff_packet) {
            Ok(()) => {}
            Err(e) if e.is_again() => {
                // Decoder is full: drain it, then push once more.
                self.take_frames()?;
                let retry = PacketMut::from(data.as_slice())
                    .with_pts(Timestamp::new(packet.pts, self.time_base))
                    .freeze();
                self.decoder
                    .try_push(retry)
                    .map_err(|e| CodecError::Decoding(format!("FFmpeg push failed: {}", e)))?;
            }
            Err(e) => return Err(CodecError::Decoding(format!("FFmpeg push failed: {}", e))),
        }

        self.take_frames()?;
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> CodecResult<Received<MediaFrame>> {
        Ok(self.output.pop())
    }
}

// SAFETY: the FFmpeg codec context is owned by this session and only used
// from the thread currently driving it.
unsafe impl Send for H264Decoder {}
