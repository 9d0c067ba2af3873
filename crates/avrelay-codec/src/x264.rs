//! x264 software video encoder.

use avrelay_types::{
    CodecId, EncodedPacket, MediaFrame, PixelFormat, StreamInfo, TimeBase, VideoFormat,
};
use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::error::CodecError;
use crate::queue::OutputQueue;
use crate::{
    CodecResult, EncoderConfig, EncoderSession, Received, SendStatus, MAX_PENDING_OUTPUTS,
};

/// Baseline-profile, zero-latency H.264 encoder over planar YUV 4:2:0 input.
pub struct X264Encoder {
    encoder: Option<x264::Encoder>,
    info: StreamInfo,
    video: VideoFormat,
    output: OutputQueue<EncodedPacket>,
    frame_count: i64,
}

impl X264Encoder {
    /// Create a new x264 encoder.
    #[instrument(name = "x264_new", skip_all)]
    pub fn new(config: &EncoderConfig) -> CodecResult<Self> {
        let video = match config.format.as_video() {
            Some(video) if video.pixel_format == PixelFormat::Yuv420p => *video,
            _ => {
                return Err(CodecError::Unsupported(format!(
                    "x264 encodes yuv420p pictures, not {}",
                    config.format
                )))
            }
        };
        if video.width % 2 != 0 || video.height % 2 != 0 || video.fps == 0 {
            return Err(CodecError::Unsupported(format!(
                "x264 needs even dimensions and a frame rate, got {}",
                config.format
            )));
        }

        let gop = config.gop_size();
        debug!(
            width = video.width,
            height = video.height,
            fps = video.fps,
            bitrate_kbps = config.bitrate_kbps,
            gop,
            "Initializing x264 encoder"
        );

        // Zero latency also disables B-frames and lookahead.
        let mut encoder = x264::Setup::preset(x264::Preset::Veryfast, x264::Tune::None, false, true)
            .fps(video.fps, 1)
            .bitrate(config.bitrate_kbps as i32)
            .max_keyframe_interval(gop as i32)
            .scenecut_threshold(0)
            .baseline()
            .build(
                x264::Colorspace::I420,
                video.width as i32,
                video.height as i32,
            )
            .map_err(|e| CodecError::Initialization(format!("x264 setup failed: {:?}", e)))?;

        let headers = encoder
            .headers()
            .map(|h| Bytes::copy_from_slice(h.entirety()))
            .map_err(|e| CodecError::Initialization(format!("x264 headers failed: {:?}", e)))?;

        let mut info = StreamInfo::new(CodecId::H264, config.format, TimeBase::per_second(video.fps));
        info.bitrate_kbps = config.bitrate_kbps;
        info.extradata = headers;

        debug!(header_size = info.extradata.len(), "x264 encoder initialized");

        Ok(Self {
            encoder: Some(encoder),
            info,
            video,
            output: OutputQueue::new(MAX_PENDING_OUTPUTS),
            frame_count: 0,
        })
    }

    fn push_output(&mut self, nal_data: &[u8], picture: &x264::Picture) {
        let packet = EncodedPacket {
            payload: Bytes::copy_from_slice(nal_data),
            stream_index: 0,
            pts: picture.pts(),
            dts: picture.dts(),
            time_base: self.info.time_base,
            keyframe: picture.keyframe(),
        };
        trace!(
            pts = packet.pts,
            dts = packet.dts,
            keyframe = packet.keyframe,
            size = packet.len(),
            "x264 packet"
        );
        self.output.push(packet);
    }

    #[instrument(name = "x264_encode", skip(self, frame), fields(sequence = frame.sequence()))]
    fn encode(&mut self, frame: &MediaFrame) -> CodecResult<()> {
        if *frame.format() != self.info.format || frame.units() != 1 {
            return Err(CodecError::InvalidInput(format!(
                "expected one {} picture, got {} x {}",
                self.info.format,
                frame.units(),
                frame.format()
            )));
        }

        let w = self.video.width as usize;
        let h = self.video.height as usize;
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let data = frame.payload();
        let (y_plane, chroma) = data.split_at(w * h);
        let (u_plane, v_plane) = chroma.split_at(cw * ch);

        let image = x264::Image::new(
            x264::Colorspace::I420,
            w as i32,
            h as i32,
            &[
                x264::Plane {
                    data: y_plane,
                    stride: w as i32,
                },
                x264::Plane {
                    data: u_plane,
                    stride: cw as i32,
                },
                x264::Plane {
                    data: v_plane,
                    stride: cw as i32,
                },
            ],
        );

        let pts = self.frame_count;
        let encoder = self.encoder.as_mut().ok_or(CodecError::Finished)?;
        let (data, picture) = encoder
            .encode(pts, image)
            .map_err(|e| CodecError::Encoding(format!("x264 encode failed: {:?}", e)))?;
        self.frame_count += 1;

        // No data while x264 is still buffering.
        if data.len() > 0 {
            let nal_data = data.entirety().to_vec();
            self.push_output(&nal_data, &picture);
        }
        Ok(())
    }

    fn flush(&mut self) {
        debug!("Flushing x264 encoder");

        let Some(encoder) = self.encoder.take() else {
            return;
        };
        let mut flush = encoder.flush();

        loop {
            match flush.next() {
                Some(Ok((data, picture))) => {
                    if data.len() > 0 {
                        let nal_data = data.entirety().to_vec();
                        self.push_output(&nal_data, &picture);
                    }
                }
                Some(Err(e)) => {
                    debug!("Flush iteration ended: {:?}", e);
                    break;
                }
                None => break,
            }
        }
    }
}

impl EncoderSession for X264Encoder {
    fn name(&self) -> &'static str {
        "x264"
    }

    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn frame_size(&self) -> usize {
        1
    }

    fn send_frame(&mut self, frame: Option<&MediaFrame>) -> CodecResult<SendStatus> {
        if self.output.is_finished() {
            return Err(CodecError::Finished);
        }
        if self.output.is_full() {
            return Ok(SendStatus::Busy);
        }

        match frame {
            Some(frame) => self.encode(frame)?,
            None => {
                self.flush();
                self.output.finish();
            }
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_packet(&mut self) -> CodecResult<Received<EncodedPacket>> {
        Ok(self.output.pop())
    }
}

impl Drop for X264Encoder {
    fn drop(&mut self) {
        debug!(frames = self.frame_count, "Closing x264 encoder");
    }
}

// SAFETY: x264::Encoder uses raw pointers internally but is designed for
// single-threaded use. The encoder is only accessed from one thread at a time.
unsafe impl Send for X264Encoder {}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::MediaFormat;

    fn qvga() -> MediaFormat {
        MediaFormat::Video(VideoFormat::new(PixelFormat::Yuv420p, 320, 240, 30))
    }

    #[test]
    fn test_first_packet_is_keyframe_with_headers() {
        let mut encoder =
            X264Encoder::new(&EncoderConfig::new(CodecId::H264, qvga(), 750)).unwrap();
        assert!(!encoder.stream_info().extradata.is_empty());

        let picture = MediaFrame::new(vec![128u8; qvga().unit_size()], qvga(), 0).unwrap();
        encoder.send_frame(Some(&picture)).unwrap();
        encoder.send_frame(None).unwrap();

        let mut packets = Vec::new();
        while let Received::Output(packet) = encoder.receive_packet().unwrap() {
            packets.push(packet);
        }
        assert!(!packets.is_empty());
        assert!(packets[0].keyframe);
        assert_eq!(packets[0].pts, 0);
    }

    #[test]
    fn test_nv12_input_unsupported() {
        let nv12 = MediaFormat::Video(VideoFormat::new(PixelFormat::Nv12, 320, 240, 30));
        let err = X264Encoder::new(&EncoderConfig::new(CodecId::H264, nv12, 750))
            .err()
            .unwrap();
        assert!(err.is_config());
    }
}
