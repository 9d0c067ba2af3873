//! Command line definition and the pipeline configuration built from it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use avrelay_types::{
    AudioFormat, CodecId, MediaKind, PipelineConfig, PixelFormat, RetryPolicy,
    SampleFormat, VideoFormat, DEFAULT_MAX_RETRY_DELAY_MS,
};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "avrelay", version, about = "Capture, transcode and relay media over RTMP")]
pub struct Cli {
    /// Raise logging to debug (twice for trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Microphone to server.
    PublishAudio(AudioArgs),
    /// Camera to server as H.264.
    PublishVideo(VideoArgs),
    /// Server to speaker or virtual microphone.
    PlayAudio(AudioArgs),
    /// Server to virtual camera.
    PlayVideo(VideoArgs),
    /// List capture and playback devices.
    Devices {
        /// Only list devices of this kind.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Audio,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Audio => MediaKind::Audio,
            KindArg::Video => MediaKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AudioCodecArg {
    Aac,
    Pcm,
}

impl From<AudioCodecArg> for CodecId {
    fn from(codec: AudioCodecArg) -> Self {
        match codec {
            AudioCodecArg::Aac => CodecId::Aac,
            AudioCodecArg::Pcm => CodecId::Pcm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PixelArg {
    Yuyv422,
    Yuv420p,
    Nv12,
    Rgb24,
    Bgr24,
}

impl From<PixelArg> for PixelFormat {
    fn from(pixel: PixelArg) -> Self {
        match pixel {
            PixelArg::Yuyv422 => PixelFormat::Yuyv422,
            PixelArg::Yuv420p => PixelFormat::Yuv420p,
            PixelArg::Nv12 => PixelFormat::Nv12,
            PixelArg::Rgb24 => PixelFormat::Rgb24,
            PixelArg::Bgr24 => PixelFormat::Bgr24,
        }
    }
}

/// Options shared by every streaming subcommand.
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Remote stream, rtmp://host[:port]/app/stream.
    pub url: String,

    /// Device selector: an index from `avrelay devices`, a name, `default`,
    /// `tone`, `bars`, `null`, `-`, `file:PATH`, `cmd:PROGRAM ARGS` or
    /// `v4l2:/dev/videoN`. Prompts when omitted on a terminal.
    #[arg(short, long)]
    pub device: Option<String>,

    /// Delay between reconnection attempts, in milliseconds.
    #[arg(long, default_value_t = avrelay_types::DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    /// Multiply the retry delay by this factor after each failed attempt.
    #[arg(long, default_value_t = 1.0)]
    pub retry_backoff: f64,

    /// Load pipeline parameters from a JSON file, replacing the format,
    /// codec and retry flags. URL and device still come from the command line.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AudioArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Sample rate in Hz.
    #[arg(short = 'r', long, default_value_t = 48000)]
    pub sample_rate: u32,

    /// Channel count.
    #[arg(short, long, default_value_t = 2)]
    pub channels: u16,

    /// Codec on the wire.
    #[arg(long, value_enum, default_value_t = AudioCodecArg::Aac)]
    pub codec: AudioCodecArg,

    /// Target bitrate in kbps.
    #[arg(short, long, default_value_t = avrelay_types::DEFAULT_AUDIO_BITRATE_KBPS)]
    pub bitrate: u32,
}

#[derive(Debug, Args)]
pub struct VideoArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Picture width.
    #[arg(short = 'W', long, default_value_t = 640)]
    pub width: u32,

    /// Picture height.
    #[arg(short = 'H', long, default_value_t = 480)]
    pub height: u32,

    /// Frame rate.
    #[arg(short, long, default_value_t = 30)]
    pub fps: u32,

    /// Camera pixel format (publish) or virtual camera pixel format (play).
    /// Defaults to yuyv422 when publishing and yuv420p when playing.
    #[arg(short, long, value_enum)]
    pub pixel_format: Option<PixelArg>,

    /// Target bitrate in kbps.
    #[arg(short, long, default_value_t = avrelay_types::DEFAULT_VIDEO_BITRATE_KBPS)]
    pub bitrate: u32,
}

impl Command {
    /// Options of a streaming subcommand.
    pub fn common(&self) -> Option<&CommonArgs> {
        match self {
            Self::PublishAudio(a) | Self::PlayAudio(a) => Some(&a.common),
            Self::PublishVideo(v) | Self::PlayVideo(v) => Some(&v.common),
            Self::Devices { .. } => None,
        }
    }

    /// Build the pipeline configuration for a streaming subcommand.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let Some(common) = self.common() else {
            bail!("devices does not run a pipeline");
        };

        let mut config = match self {
            Self::PublishAudio(args) => {
                let mut config = PipelineConfig::audio_publish(
                    common.url.clone(),
                    args.audio_format(),
                    args.codec.into(),
                );
                config.bitrate_kbps = args.bitrate;
                config
            }
            Self::PlayAudio(args) => PipelineConfig::audio_play(
                common.url.clone(),
                args.audio_format(),
                args.codec.into(),
            ),
            Self::PublishVideo(args) => {
                let mut config = PipelineConfig::video_publish(
                    common.url.clone(),
                    args.video_format(PixelArg::Yuyv422),
                );
                config.bitrate_kbps = args.bitrate;
                config
            }
            Self::PlayVideo(args) => PipelineConfig::video_play(
                common.url.clone(),
                args.video_format(PixelArg::Yuv420p),
            ),
            Self::Devices { .. } => bail!("devices does not run a pipeline"),
        };
        config.retry = common.retry_policy();

        if let Some(path) = &common.config {
            config = load_config(path, &config)?;
        }

        config.validate()?;
        Ok(config)
    }
}

impl CommonArgs {
    fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::fixed(Duration::from_millis(self.retry_delay_ms));
        policy.multiplier = self.retry_backoff;
        if self.retry_backoff > 1.0 {
            policy.max_delay_ms = DEFAULT_MAX_RETRY_DELAY_MS.max(self.retry_delay_ms);
        }
        policy
    }
}

impl AudioArgs {
    fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(SampleFormat::S16, self.channels, self.sample_rate)
    }
}

impl VideoArgs {
    fn video_format(&self, default_pixel: PixelArg) -> VideoFormat {
        let pixel = self.pixel_format.unwrap_or(default_pixel);
        VideoFormat::new(pixel.into(), self.width, self.height, self.fps)
    }
}

/// Read a JSON configuration, keeping the command line's URL and checking
/// it describes the same kind of pipeline.
fn load_config(path: &Path, from_flags: &PipelineConfig) -> Result<PipelineConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut config: PipelineConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if config.direction != from_flags.direction {
        bail!(
            "{} describes a {} pipeline, the subcommand is {}",
            path.display(),
            config.direction.name(),
            from_flags.direction.name()
        );
    }
    if config.target_format.kind() != from_flags.target_format.kind() {
        bail!(
            "{} describes {} media, the subcommand streams {}",
            path.display(),
            config.target_format.kind().name(),
            from_flags.target_format.kind().name()
        );
    }

    config.url = from_flags.url.clone();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::{Direction, MediaFormat};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_publish_audio_defaults() {
        let cli = parse(&["avrelay", "publish-audio", "rtmp://host/live/key"]);
        let config = cli.command.pipeline_config().unwrap();

        assert_eq!(config.direction, Direction::Publish);
        assert_eq!(config.codec, CodecId::Aac);
        assert_eq!(config.bitrate_kbps, 128);
        assert_eq!(
            config.source_format,
            Some(MediaFormat::Audio(AudioFormat::new(SampleFormat::S16, 2, 48000)))
        );
        assert_eq!(config.retry.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn test_publish_video_flags() {
        let cli = parse(&[
            "avrelay",
            "publish-video",
            "rtmp://host/live/key",
            "-W",
            "1280",
            "-H",
            "720",
            "--fps",
            "25",
            "--device",
            "bars",
        ]);
        assert_eq!(cli.command.common().unwrap().device.as_deref(), Some("bars"));

        let config = cli.command.pipeline_config().unwrap();
        let Some(MediaFormat::Video(source)) = config.source_format else {
            panic!("expected a video source format");
        };
        assert_eq!((source.width, source.height, source.fps), (1280, 720, 25));
        assert_eq!(source.pixel_format, PixelFormat::Yuyv422);
        assert_eq!(config.codec, CodecId::H264);
        assert_eq!(config.bitrate_kbps, 750);
    }

    #[test]
    fn test_play_video_defaults_to_yuv420p() {
        let cli = parse(&["avrelay", "play-video", "rtmp://host/live/key"]);
        let config = cli.command.pipeline_config().unwrap();
        assert_eq!(config.direction, Direction::Play);
        assert!(config.source_format.is_none());
        let MediaFormat::Video(target) = config.target_format else {
            panic!("expected a video target");
        };
        assert_eq!(target.pixel_format, PixelFormat::Yuv420p);
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let cli = parse(&[
            "avrelay",
            "play-audio",
            "rtmp://host/live/key",
            "--retry-delay-ms",
            "500",
            "--retry-backoff",
            "2",
        ]);
        let config = cli.command.pipeline_config().unwrap();
        assert_eq!(config.retry.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.retry.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(
            config.retry.delay_for_attempt(20),
            Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS)
        );
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let cli = parse(&["avrelay", "publish-audio", "rtmp://host/live/key", "-c", "0"]);
        assert!(cli.command.pipeline_config().is_err());

        let cli = parse(&["avrelay", "publish-audio", "rtmp://host/live/key", "--retry-backoff", "0.5"]);
        assert!(cli.command.pipeline_config().is_err());
    }

    #[test]
    fn test_config_file_overlay() {
        let base = PipelineConfig::audio_publish(
            "rtmp://ignored/live/x",
            AudioFormat::new(SampleFormat::S16, 1, 16000),
            CodecId::Pcm,
        );
        let path = std::env::temp_dir().join(format!("avrelay-cli-{}.json", std::process::id()));
        fs::write(&path, serde_json::to_string(&base).unwrap()).unwrap();

        let cli = parse(&[
            "avrelay",
            "publish-audio",
            "rtmp://host/live/key",
            "--config",
            path.to_str().unwrap(),
        ]);
        let config = cli.command.pipeline_config().unwrap();
        assert_eq!(config.url, "rtmp://host/live/key");
        assert_eq!(config.codec, CodecId::Pcm);
        assert_eq!(config.retry, base.retry);

        let cli = parse(&[
            "avrelay",
            "play-video",
            "rtmp://host/live/key",
            "--config",
            path.to_str().unwrap(),
        ]);
        assert!(cli.command.pipeline_config().is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_devices_subcommand() {
        let cli = parse(&["avrelay", "devices", "--kind", "video"]);
        assert!(matches!(cli.command, Command::Devices { kind: Some(KindArg::Video) }));
        assert!(cli.command.common().is_none());
        assert!(cli.command.pipeline_config().is_err());
    }
}
