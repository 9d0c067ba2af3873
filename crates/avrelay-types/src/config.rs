//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::media::{AudioFormat, CodecId, MediaFormat, PixelFormat, SampleFormat, VideoFormat};
use crate::{
    DEFAULT_AUDIO_BATCH_UNITS, DEFAULT_AUDIO_BITRATE_KBPS, DEFAULT_BUFFER_UNITS,
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_RETRY_DELAY_MS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_RETRY_DELAY_MS, DEFAULT_VIDEO_BITRATE_KBPS,
};

/// Which way media flows through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local capture device to remote server.
    Publish,

    /// Remote server to local playback device.
    Play,
}

impl Direction {
    /// Returns the display name for this direction.
    pub fn name(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Play => "play",
        }
    }
}

/// Delay schedule between connection attempts.
///
/// With the default multiplier of 1.0 every attempt waits the same initial
/// delay. Attempts are never limited; only cancellation ends retrying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,

    /// Growth factor applied per further attempt.
    pub multiplier: f64,

    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RETRY_DELAY_MS,
            multiplier: 1.0,
            max_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between every attempt.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            multiplier: 1.0,
            max_delay_ms: ms,
        }
    }

    /// Calculate delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

/// Immutable parameters of one pipeline.
///
/// Shared as `Arc<PipelineConfig>` once the pipeline starts; a change means
/// building a new pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Flow direction.
    pub direction: Direction,

    /// Remote stream URL, `rtmp://host[:port]/app/stream`.
    pub url: String,

    /// Format produced by the source. Required when publishing; when playing
    /// it is learned from the decoder and may be left empty.
    #[serde(default)]
    pub source_format: Option<MediaFormat>,

    /// Format handed to the encoder (publish) or playback device (play).
    pub target_format: MediaFormat,

    /// Compressed codec on the wire.
    pub codec: CodecId,

    /// Target bitrate in kbps.
    #[serde(default)]
    pub bitrate_kbps: u32,

    /// Source units per relay buffer unit: samples for audio, pictures for video.
    #[serde(default = "default_batch_units")]
    pub batch_units: usize,

    /// Relay buffer depth in batches.
    #[serde(default = "default_buffer_units")]
    pub buffer_units: usize,

    /// Upper bound on how long the consumer waits for a batch, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout of a single source read, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// A source silent for this long is treated as disconnected, in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Reconnection delays.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_batch_units() -> usize {
    1
}

fn default_buffer_units() -> usize {
    DEFAULT_BUFFER_UNITS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

impl PipelineConfig {
    fn base(
        direction: Direction,
        url: impl Into<String>,
        source_format: Option<MediaFormat>,
        target_format: MediaFormat,
        codec: CodecId,
        bitrate_kbps: u32,
        batch_units: usize,
    ) -> Self {
        Self {
            direction,
            url: url.into(),
            source_format,
            target_format,
            codec,
            bitrate_kbps,
            batch_units,
            buffer_units: DEFAULT_BUFFER_UNITS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }

    /// Microphone to server: interleaved S16 capture, batches of one codec frame.
    pub fn audio_publish(url: impl Into<String>, capture: AudioFormat, codec: CodecId) -> Self {
        let target = AudioFormat::new(SampleFormat::S16, capture.channels, capture.sample_rate);
        Self::base(
            Direction::Publish,
            url,
            Some(capture.into()),
            target.into(),
            codec,
            DEFAULT_AUDIO_BITRATE_KBPS,
            DEFAULT_AUDIO_BATCH_UNITS,
        )
    }

    /// Camera to server: one picture per batch, converted to YUV420P for H.264.
    pub fn video_publish(url: impl Into<String>, capture: VideoFormat) -> Self {
        let target = VideoFormat::new(
            PixelFormat::Yuv420p,
            capture.width,
            capture.height,
            capture.fps,
        );
        Self::base(
            Direction::Publish,
            url,
            Some(capture.into()),
            target.into(),
            CodecId::H264,
            DEFAULT_VIDEO_BITRATE_KBPS,
            1,
        )
    }

    /// Server to speaker.
    pub fn audio_play(url: impl Into<String>, playback: AudioFormat, codec: CodecId) -> Self {
        Self::base(
            Direction::Play,
            url,
            None,
            playback.into(),
            codec,
            0,
            DEFAULT_AUDIO_BATCH_UNITS,
        )
    }

    /// Server to virtual camera.
    pub fn video_play(url: impl Into<String>, output: VideoFormat) -> Self {
        Self::base(
            Direction::Play,
            url,
            None,
            output.into(),
            CodecId::H264,
            0,
            1,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Check the configuration for values no pipeline could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid("url", "must not be empty"));
        }

        validate_format("target_format", &self.target_format)?;

        if let Some(source) = &self.source_format {
            validate_format("source_format", source)?;
            if source.kind() != self.target_format.kind() {
                return Err(ConfigError::KindMismatch {
                    source_kind: source.kind(),
                    target_kind: self.target_format.kind(),
                });
            }
        } else if self.direction == Direction::Publish {
            return Err(ConfigError::invalid(
                "source_format",
                "required when publishing",
            ));
        }

        if self.codec.kind() != self.target_format.kind() {
            return Err(ConfigError::CodecMismatch {
                codec: self.codec.name(),
                kind: self.target_format.kind(),
            });
        }

        if self.batch_units == 0 {
            return Err(ConfigError::invalid("batch_units", "must be at least 1"));
        }
        if self.buffer_units == 0 {
            return Err(ConfigError::invalid("buffer_units", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be non-zero"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::invalid("read_timeout_ms", "must be non-zero"));
        }
        if self.idle_timeout_ms < self.read_timeout_ms {
            return Err(ConfigError::invalid(
                "idle_timeout_ms",
                "must not be shorter than read_timeout_ms",
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be >= 1.0"));
        }

        Ok(())
    }
}

fn validate_format(field: &'static str, format: &MediaFormat) -> Result<(), ConfigError> {
    match format {
        MediaFormat::Audio(a) => {
            if a.sample_rate == 0 {
                return Err(ConfigError::invalid(field, "sample rate is zero"));
            }
            if a.channels == 0 {
                return Err(ConfigError::invalid(field, "channel count is zero"));
            }
        }
        MediaFormat::Video(v) => {
            if v.width == 0 || v.height == 0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("dimensions {}x{} contain zero", v.width, v.height),
                ));
            }
            if v.fps == 0 {
                return Err(ConfigError::invalid(field, "frame rate is zero"));
            }
            if v.pixel_format == PixelFormat::Yuyv422 && v.width % 2 != 0 {
                return Err(ConfigError::invalid(field, "yuyv422 width must be even"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> AudioFormat {
        AudioFormat::new(SampleFormat::S16, 2, 48000)
    }

    #[test]
    fn test_retry_policy_default_is_fixed() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_policy_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 3000,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_presets_validate() {
        let url = "rtmp://localhost/live/mic";
        assert!(PipelineConfig::audio_publish(url, stereo(), CodecId::Aac)
            .validate()
            .is_ok());
        assert!(PipelineConfig::audio_play(url, stereo(), CodecId::Aac)
            .validate()
            .is_ok());

        let cam = VideoFormat::new(PixelFormat::Yuyv422, 640, 480, 30);
        assert!(PipelineConfig::video_publish(url, cam).validate().is_ok());
        let out = VideoFormat::new(PixelFormat::Bgr24, 1280, 720, 30);
        assert!(PipelineConfig::video_play(url, out).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_yuyv_width() {
        let cam = VideoFormat::new(PixelFormat::Yuyv422, 641, 480, 30);
        let config = PipelineConfig::video_publish("rtmp://h/a/s", cam);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_codec_kind_mismatch() {
        let mut config = PipelineConfig::audio_publish("rtmp://h/a/s", stereo(), CodecId::Aac);
        config.codec = CodecId::H264;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CodecMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = PipelineConfig::audio_publish("rtmp://h/a/s", stereo(), CodecId::Pcm);
        config.buffer_units = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::audio_publish("rtmp://h/a/s", stereo(), CodecId::Pcm);
        config.batch_units = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let json = r#"{
            "direction": "play",
            "url": "rtmp://localhost/live/cam",
            "target_format": {"kind": "video", "pixel_format": "bgr24", "width": 640, "height": 480, "fps": 30},
            "codec": "h264"
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.buffer_units, DEFAULT_BUFFER_UNITS);
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.validate().is_ok());
    }
}
