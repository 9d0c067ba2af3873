//! Synthetic devices for running without hardware.

use std::f32::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

use avrelay_convert::{encode_samples, Scaler};
use avrelay_types::{
    AudioFormat, CaptureDevice, DeviceError, DeviceResult, Incoming, MediaFormat, MediaFrame,
    PixelFormat, PlaybackDevice, VideoFormat,
};
use bytes::Bytes;
use tracing::{debug, info};

/// Release times for a fixed-rate generator.
struct Pacer {
    period: Duration,
    next: Option<Instant>,
    realtime: bool,
}

impl Pacer {
    fn new(period: Duration, realtime: bool) -> Self {
        Self {
            period,
            next: None,
            realtime,
        }
    }

    /// Wait for the next release. Returns false if `timeout` ran out first.
    fn wait(&mut self, timeout: Duration) -> bool {
        if !self.realtime {
            return true;
        }

        let now = Instant::now();
        let next = *self.next.get_or_insert(now);
        if next > now {
            let wait = next - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }
        self.next = Some(next + self.period);
        true
    }

    fn reset(&mut self) {
        self.next = None;
    }
}

/// Sine tone generator.
pub struct ToneCapture {
    frequency: f32,
    amplitude: f32,
    format: Option<AudioFormat>,
    sample_index: u64,
    pacer: Pacer,
}

impl ToneCapture {
    /// Tone at `frequency` Hz, delivered in real time as 10 ms chunks.
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            amplitude: 0.5,
            format: None,
            sample_index: 0,
            pacer: Pacer::new(Duration::from_millis(10), true),
        }
    }

    /// Deliver chunks as fast as they are read.
    pub fn unpaced(mut self) -> Self {
        self.pacer.realtime = false;
        self
    }
}

impl CaptureDevice for ToneCapture {
    fn name(&self) -> &str {
        "tone"
    }

    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
        let audio = format
            .as_audio()
            .ok_or_else(|| DeviceError::Unsupported(format!("{format} from a tone source")))?;

        self.format = Some(*audio);
        self.sample_index = 0;
        self.pacer.reset();
        info!(frequency = self.frequency, format = %format, "Tone source opened");
        Ok(*format)
    }

    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
        let format = self.format.ok_or(DeviceError::NotOpen)?;
        if !self.pacer.wait(timeout) {
            return Ok(Incoming::Timeout);
        }

        let samples_per_chunk = (format.sample_rate / 100).max(1) as usize;
        let channels = format.channels as usize;
        let mut samples = Vec::with_capacity(samples_per_chunk * channels);

        for _ in 0..samples_per_chunk {
            let t = self.sample_index as f32 / format.sample_rate as f32;
            let value = self.amplitude * (2.0 * PI * self.frequency * t).sin();
            samples.extend(std::iter::repeat(value).take(channels));
            self.sample_index += 1;
        }

        Ok(Incoming::Data(Bytes::from(encode_samples(
            &samples,
            format.sample_format,
            channels,
        ))))
    }

    fn close(&mut self) {
        if self.format.take().is_some() {
            debug!("Tone source closed");
        }
    }
}

/// 75% SMPTE-style colour bars in RGB.
const BARS: [[u8; 3]; 7] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
];

/// Scrolling colour bar generator.
pub struct ColorBarsCapture {
    format: Option<VideoFormat>,
    scaler: Option<Scaler>,
    frame_index: u64,
    pacer: Pacer,
}

impl ColorBarsCapture {
    /// Bars delivered in real time at the opened frame rate.
    pub fn new() -> Self {
        Self {
            format: None,
            scaler: None,
            frame_index: 0,
            pacer: Pacer::new(Duration::from_millis(33), true),
        }
    }

    /// Deliver pictures as fast as they are read.
    pub fn unpaced(mut self) -> Self {
        self.pacer.realtime = false;
        self
    }

    fn render_rgb(&self, format: &VideoFormat) -> Vec<u8> {
        let w = format.width as usize;
        let h = format.height as usize;
        let shift = (self.frame_index as usize * 4) % w.max(1);
        let mut rgb = Vec::with_capacity(w * h * 3);

        for _ in 0..h {
            for x in 0..w {
                let bar = ((x + shift) % w) * BARS.len() / w;
                rgb.extend_from_slice(&BARS[bar]);
            }
        }
        rgb
    }
}

impl Default for ColorBarsCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for ColorBarsCapture {
    fn name(&self) -> &str {
        "bars"
    }

    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
        let video = *format
            .as_video()
            .ok_or_else(|| DeviceError::Unsupported(format!("{format} from a colour bar source")))?;

        let rgb = VideoFormat::new(PixelFormat::Rgb24, video.width, video.height, video.fps);
        self.scaler = if video.pixel_format == PixelFormat::Rgb24 {
            None
        } else {
            Some(Scaler::new(rgb, video).map_err(|e| DeviceError::Unsupported(e.to_string()))?)
        };

        self.pacer = Pacer::new(
            Duration::from_secs(1) / video.fps.max(1),
            self.pacer.realtime,
        );
        self.format = Some(video);
        self.frame_index = 0;
        info!(format = %format, "Colour bar source opened");
        Ok(*format)
    }

    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
        let format = self.format.ok_or(DeviceError::NotOpen)?;
        if !self.pacer.wait(timeout) {
            return Ok(Incoming::Timeout);
        }

        let rgb = self.render_rgb(&format);
        let sequence = self.frame_index;
        self.frame_index += 1;

        let payload = match self.scaler.as_mut() {
            None => Bytes::from(rgb),
            Some(scaler) => {
                let rgb_format = MediaFormat::Video(scaler.input());
                let picture = MediaFrame::new(rgb, rgb_format, sequence)
                    .map_err(|e| DeviceError::Backend(e.to_string()))?;
                scaler
                    .process(&picture)
                    .map_err(|e| DeviceError::Backend(e.to_string()))?
                    .into_payload()
            }
        };

        Ok(Incoming::Data(payload))
    }

    fn close(&mut self) {
        self.scaler = None;
        if self.format.take().is_some() {
            debug!("Colour bar source closed");
        }
    }
}

/// Playback device that discards every frame.
#[derive(Debug, Default)]
pub struct NullPlayback {
    open: bool,
    frames: u64,
}

impl NullPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames accepted since the last open.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl PlaybackDevice for NullPlayback {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, _format: &MediaFormat) -> DeviceResult<()> {
        self.open = true;
        self.frames = 0;
        Ok(())
    }

    fn write(&mut self, _frame: &MediaFrame) -> DeviceResult<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::SampleFormat;

    #[test]
    fn test_tone_chunk_is_ten_millis() {
        let format = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, 48000));
        let mut tone = ToneCapture::new(440.0).unpaced();
        tone.open(&format).unwrap();

        match tone.read(Duration::from_millis(10)).unwrap() {
            Incoming::Data(bytes) => assert_eq!(bytes.len(), 480 * 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tone_starts_at_zero_crossing() {
        let format = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 1, 8000));
        let mut tone = ToneCapture::new(1000.0).unpaced();
        tone.open(&format).unwrap();

        let Incoming::Data(bytes) = tone.read(Duration::ZERO).unwrap() else {
            panic!("no data");
        };
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        // Quarter period of 1 kHz at 8 kHz is sample 2: the peak.
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), 16384);
    }

    #[test]
    fn test_bars_match_picture_size() {
        for pixel_format in [PixelFormat::Yuyv422, PixelFormat::Yuv420p, PixelFormat::Rgb24] {
            let video = VideoFormat::new(pixel_format, 64, 48, 30);
            let mut bars = ColorBarsCapture::new().unpaced();
            bars.open(&MediaFormat::Video(video)).unwrap();

            let Incoming::Data(bytes) = bars.read(Duration::ZERO).unwrap() else {
                panic!("no data");
            };
            assert_eq!(bytes.len(), video.picture_size());
        }
    }

    #[test]
    fn test_read_before_open_fails() {
        let mut bars = ColorBarsCapture::new();
        assert!(matches!(bars.read(Duration::ZERO), Err(DeviceError::NotOpen)));

        let mut null = NullPlayback::new();
        let format = MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 1, 8000));
        let frame = MediaFrame::new(vec![0u8; 2], format, 0).unwrap();
        assert!(null.write(&frame).is_err());
        null.open(&format).unwrap();
        null.write(&frame).unwrap();
        assert_eq!(null.frames(), 1);
    }
}
