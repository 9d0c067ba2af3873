//! V4L2 cameras and v4l2loopback virtual cameras through an `ffmpeg` child.

use std::path::Path;
use std::time::Duration;

use avrelay_types::{
    CaptureDevice, DeviceError, DeviceResult, Incoming, MediaFormat, MediaFrame, PixelFormat,
    PlaybackDevice, VideoFormat,
};
use bytes::Bytes;
use tracing::info;

use crate::pipe::{PipeCapture, PipeEndpoint, PipePlayback};

const FFMPEG: &str = "ffmpeg";

/// Pixel format the virtual camera is fed with.
const LOOPBACK_PIX_FMT: &str = "yuv420p";

fn video_format(format: &MediaFormat) -> DeviceResult<&VideoFormat> {
    format
        .as_video()
        .ok_or_else(|| DeviceError::Unsupported(format!("{format} on a video device")))
}

fn check_node(device: &str) -> DeviceResult<()> {
    if Path::new(device).exists() {
        Ok(())
    } else {
        Err(DeviceError::NotFound(device.to_string()))
    }
}

/// Arguments for reading raw pictures from a V4L2 node.
pub fn capture_args(device: &str, format: &VideoFormat) -> Vec<String> {
    let mut args: Vec<String> = vec![FFMPEG.into(), "-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend(["-f", "v4l2"].map(String::from));
    if format.pixel_format == PixelFormat::Yuyv422 {
        args.extend(["-input_format", "yuyv422"].map(String::from));
    }
    args.extend([
        "-video_size".to_string(),
        format!("{}x{}", format.width, format.height),
        "-framerate".to_string(),
        format.fps.to_string(),
        "-i".to_string(),
        device.to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        format.pixel_format.name().to_string(),
        "-".to_string(),
    ]);
    args
}

/// Arguments for writing raw pictures into a v4l2loopback node.
pub fn loopback_args(device: &str, format: &VideoFormat) -> Vec<String> {
    vec![
        FFMPEG.to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        format.pixel_format.name().to_string(),
        "-video_size".to_string(),
        format!("{}x{}", format.width, format.height),
        "-framerate".to_string(),
        format.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-f".to_string(),
        "v4l2".to_string(),
        "-pix_fmt".to_string(),
        LOOPBACK_PIX_FMT.to_string(),
        device.to_string(),
    ]
}

/// Camera capture from a V4L2 device node.
pub struct V4l2Capture {
    device: String,
    inner: Option<PipeCapture>,
}

impl V4l2Capture {
    /// Create a capture for a node such as `/dev/video0`.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            inner: None,
        }
    }
}

impl CaptureDevice for V4l2Capture {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
        self.close();

        let video = video_format(format)?;
        check_node(&self.device)?;

        let args = capture_args(&self.device, video);
        info!(device = %self.device, format = %format, "Opening camera");

        let mut inner = PipeCapture::new(PipeEndpoint::Command(args)).with_name(self.device.clone());
        let negotiated = inner.open(format)?;
        self.inner = Some(inner);
        Ok(negotiated)
    }

    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(timeout),
            None => Err(DeviceError::NotOpen),
        }
    }

    fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }
}

/// Virtual camera output into a v4l2loopback device node.
pub struct V4l2Output {
    device: String,
    inner: Option<PipePlayback>,
}

impl V4l2Output {
    /// Create an output for a loopback node such as `/dev/video10`.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            inner: None,
        }
    }
}

impl PlaybackDevice for V4l2Output {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&mut self, format: &MediaFormat) -> DeviceResult<()> {
        self.close();

        let video = video_format(format)?;
        check_node(&self.device)?;

        info!(device = %self.device, format = %format, "Opening virtual camera");
        let mut inner = PipePlayback::new(PipeEndpoint::Command(loopback_args(&self.device, video)))
            .with_name(self.device.clone());
        inner.open(format)?;
        self.inner = Some(inner);
        Ok(())
    }

    fn write(&mut self, frame: &MediaFrame) -> DeviceResult<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.write(frame),
            None => Err(DeviceError::NotOpen),
        }
    }

    fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::{AudioFormat, SampleFormat};

    #[test]
    fn test_capture_args_request_yuyv() {
        let format = VideoFormat::new(PixelFormat::Yuyv422, 640, 480, 30);
        let args = capture_args("/dev/video0", &format);
        let joined = args.join(" ");
        assert!(joined.starts_with("ffmpeg"));
        assert!(joined.contains("-input_format yuyv422"));
        assert!(joined.contains("-video_size 640x480 -framerate 30 -i /dev/video0"));
        assert!(joined.ends_with("-pix_fmt yuyv422 -"));
    }

    #[test]
    fn test_loopback_args_target_device() {
        let format = VideoFormat::new(PixelFormat::Bgr24, 1280, 720, 25);
        let args = loopback_args("/dev/video10", &format);
        assert_eq!(args.last().map(String::as_str), Some("/dev/video10"));
        assert!(args.join(" ").contains("-pix_fmt bgr24 -video_size 1280x720"));
    }

    #[test]
    fn test_audio_format_is_unsupported() {
        let mut camera = V4l2Capture::new("/dev/video0");
        let audio = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, 48000));
        assert!(matches!(camera.open(&audio), Err(DeviceError::Unsupported(_))));
    }

    #[test]
    fn test_missing_node_is_not_found() {
        let mut camera = V4l2Capture::new("/dev/avrelay-missing-node");
        let format = MediaFormat::Video(VideoFormat::new(PixelFormat::Yuyv422, 640, 480, 30));
        assert!(matches!(camera.open(&format), Err(DeviceError::NotFound(_))));
    }
}
