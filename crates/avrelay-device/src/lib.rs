//! Local capture and playback devices.
//!
//! Every device implements the collaborator traits from `avrelay-types`.
//! Sound cards use cpal behind the `device-cpal` feature; cameras and virtual
//! cameras go through an `ffmpeg` child; pipes and synthetic sources work
//! everywhere.

#[cfg(feature = "device-cpal")]
mod cpal_audio;
mod pipe;
mod synthetic;
mod v4l2;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[cfg(feature = "device-cpal")]
pub use cpal_audio::{CpalCapture, CpalPlayback};
pub use pipe::{PipeCapture, PipeEndpoint, PipePlayback};
pub use synthetic::{ColorBarsCapture, NullPlayback, ToneCapture};
pub use v4l2::{capture_args, loopback_args, V4l2Capture, V4l2Output};

use avrelay_types::{
    CaptureDevice, DeviceDirection, DeviceError, DeviceInfo, DeviceResult, MediaKind,
    PlaybackDevice,
};
use tracing::debug;

/// Channel capacity between a pipe reader thread and the device.
pub const PIPE_CHANNEL_CAPACITY: usize = 8;

/// Channel capacity between a cpal callback and the device.
pub const CPAL_CHANNEL_CAPACITY: usize = 16;

/// Frequency of the synthetic tone.
pub const TONE_FREQUENCY_HZ: f32 = 440.0;

/// Selects a device from the command line.
///
/// Accepted forms: `default`, an enumeration index, `tone`, `bars`, `null`,
/// `-` for stdin/stdout, `file:PATH`, `cmd:PROGRAM ARGS...`,
/// `v4l2:/dev/videoN` (or a bare `/dev/video*` path) and `cpal:NAME` (or any
/// other name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    Default,
    Index(usize),
    Tone,
    Bars,
    Null,
    Pipe(PipeEndpoint),
    V4l2(String),
    Cpal(String),
}

impl FromStr for DeviceSpec {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DeviceError::NotFound("empty device selector".to_string()));
        }

        let spec = match s {
            "default" => Self::Default,
            "tone" => Self::Tone,
            "bars" => Self::Bars,
            "null" => Self::Null,
            "-" => Self::Pipe(PipeEndpoint::Stdio),
            _ => {
                if let Ok(index) = s.parse::<usize>() {
                    Self::Index(index)
                } else if let Some(path) = s.strip_prefix("file:") {
                    Self::Pipe(PipeEndpoint::File(PathBuf::from(path)))
                } else if let Some(command) = s.strip_prefix("cmd:") {
                    let args: Vec<String> = command.split_whitespace().map(String::from).collect();
                    if args.is_empty() {
                        return Err(DeviceError::NotFound("empty command".to_string()));
                    }
                    Self::Pipe(PipeEndpoint::Command(args))
                } else if let Some(node) = s.strip_prefix("v4l2:") {
                    Self::V4l2(node.to_string())
                } else if s.starts_with("/dev/video") {
                    Self::V4l2(s.to_string())
                } else if let Some(name) = s.strip_prefix("cpal:") {
                    Self::Cpal(name.to_string())
                } else {
                    Self::Cpal(s.to_string())
                }
            }
        };
        Ok(spec)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Index(i) => write!(f, "{i}"),
            Self::Tone => write!(f, "tone"),
            Self::Bars => write!(f, "bars"),
            Self::Null => write!(f, "null"),
            Self::Pipe(PipeEndpoint::Stdio) => write!(f, "-"),
            Self::Pipe(PipeEndpoint::File(path)) => write!(f, "file:{}", path.display()),
            Self::Pipe(PipeEndpoint::Command(args)) => write!(f, "cmd:{}", args.join(" ")),
            Self::V4l2(node) => write!(f, "v4l2:{node}"),
            Self::Cpal(name) => write!(f, "cpal:{name}"),
        }
    }
}

/// All known devices with the selector that opens each.
fn catalog() -> Vec<(DeviceInfo, DeviceSpec)> {
    let mut entries = Vec::new();

    let synthetic = |name: &str, direction: DeviceDirection, kind: MediaKind| DeviceInfo {
        index: 0,
        name: name.to_string(),
        direction,
        kind,
        max_channels: if kind == MediaKind::Audio { 8 } else { 0 },
        formats: Vec::new(),
        is_default: false,
    };

    push_sound_cards(&mut entries);

    for node in video_nodes() {
        let info = DeviceInfo {
            index: 0,
            name: node.clone(),
            direction: DeviceDirection::Input,
            kind: MediaKind::Video,
            max_channels: 0,
            formats: Vec::new(),
            is_default: node == "/dev/video0",
        };
        entries.push((info, DeviceSpec::V4l2(node)));
    }

    entries.push((
        synthetic("tone", DeviceDirection::Input, MediaKind::Audio),
        DeviceSpec::Tone,
    ));
    entries.push((
        synthetic("bars", DeviceDirection::Input, MediaKind::Video),
        DeviceSpec::Bars,
    ));
    for kind in [MediaKind::Audio, MediaKind::Video] {
        entries.push((
            synthetic("null", DeviceDirection::Output, kind),
            DeviceSpec::Null,
        ));
    }

    for (index, (info, _)) in entries.iter_mut().enumerate() {
        info.index = index;
    }
    entries
}

#[cfg(feature = "device-cpal")]
fn push_sound_cards(entries: &mut Vec<(DeviceInfo, DeviceSpec)>) {
    for direction in [DeviceDirection::Input, DeviceDirection::Output] {
        for info in cpal_audio::list(direction) {
            let spec = DeviceSpec::Cpal(info.name.clone());
            entries.push((info, spec));
        }
    }
}

#[cfg(not(feature = "device-cpal"))]
fn push_sound_cards(_entries: &mut Vec<(DeviceInfo, DeviceSpec)>) {}

fn video_nodes() -> Vec<String> {
    let mut nodes: Vec<String> = std::fs::read_dir("/dev")
        .map(|dir| {
            dir.filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.starts_with("video"))
                .map(|name| format!("/dev/{name}"))
                .collect()
        })
        .unwrap_or_default();
    nodes.sort();
    nodes
}

/// Enumerate capture and playback devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    catalog().into_iter().map(|(info, _)| info).collect()
}

/// Devices usable for `direction` and `kind`, in enumeration order.
pub fn list_matching(direction: DeviceDirection, kind: MediaKind) -> Vec<DeviceInfo> {
    list_devices()
        .into_iter()
        .filter(|d| d.direction == direction && d.kind == kind)
        .collect()
}

fn resolve(spec: &DeviceSpec, direction: DeviceDirection, kind: MediaKind) -> DeviceResult<DeviceSpec> {
    match spec {
        DeviceSpec::Index(index) => catalog()
            .into_iter()
            .find(|(info, _)| info.index == *index)
            .filter(|(info, _)| info.direction == direction && info.kind == kind)
            .map(|(_, spec)| spec)
            .ok_or_else(|| DeviceError::NotFound(format!("device index {index}"))),
        DeviceSpec::Default if kind == MediaKind::Video => match direction {
            DeviceDirection::Input => Ok(DeviceSpec::V4l2("/dev/video0".to_string())),
            DeviceDirection::Output => Err(DeviceError::NotFound(
                "no default virtual camera, name a v4l2loopback node".to_string(),
            )),
        },
        other => Ok(other.clone()),
    }
}

/// Create a capture device for `spec`.
pub fn capture_device(spec: &DeviceSpec, kind: MediaKind) -> DeviceResult<Box<dyn CaptureDevice>> {
    let spec = resolve(spec, DeviceDirection::Input, kind)?;
    debug!(device = %spec, "Creating capture device");

    match spec {
        DeviceSpec::Tone => Ok(Box::new(ToneCapture::new(TONE_FREQUENCY_HZ))),
        DeviceSpec::Bars => Ok(Box::new(ColorBarsCapture::new())),
        DeviceSpec::Pipe(endpoint) => Ok(Box::new(PipeCapture::new(endpoint))),
        DeviceSpec::V4l2(node) => Ok(Box::new(V4l2Capture::new(node))),
        DeviceSpec::Null => Err(DeviceError::Unsupported("null is an output".to_string())),
        DeviceSpec::Default | DeviceSpec::Cpal(_) => cpal_capture(spec),
        DeviceSpec::Index(_) => Err(DeviceError::NotFound(spec.to_string())),
    }
}

/// Create a playback device for `spec`.
pub fn playback_device(spec: &DeviceSpec, kind: MediaKind) -> DeviceResult<Box<dyn PlaybackDevice>> {
    let spec = resolve(spec, DeviceDirection::Output, kind)?;
    debug!(device = %spec, "Creating playback device");

    match spec {
        DeviceSpec::Null => Ok(Box::new(NullPlayback::new())),
        DeviceSpec::Pipe(endpoint) => Ok(Box::new(PipePlayback::new(endpoint))),
        DeviceSpec::V4l2(node) => Ok(Box::new(V4l2Output::new(node))),
        DeviceSpec::Tone | DeviceSpec::Bars => {
            Err(DeviceError::Unsupported(format!("{spec} is an input")))
        }
        DeviceSpec::Default | DeviceSpec::Cpal(_) => cpal_playback(spec),
        DeviceSpec::Index(_) => Err(DeviceError::NotFound(spec.to_string())),
    }
}

#[cfg(feature = "device-cpal")]
fn cpal_capture(spec: DeviceSpec) -> DeviceResult<Box<dyn CaptureDevice>> {
    let name = match spec {
        DeviceSpec::Cpal(name) => Some(name),
        _ => None,
    };
    Ok(Box::new(CpalCapture::new(name)))
}

#[cfg(not(feature = "device-cpal"))]
fn cpal_capture(spec: DeviceSpec) -> DeviceResult<Box<dyn CaptureDevice>> {
    Err(DeviceError::Unsupported(format!(
        "sound card {spec} (built without device-cpal)"
    )))
}

#[cfg(feature = "device-cpal")]
fn cpal_playback(spec: DeviceSpec) -> DeviceResult<Box<dyn PlaybackDevice>> {
    let name = match spec {
        DeviceSpec::Cpal(name) => Some(name),
        _ => None,
    };
    Ok(Box::new(CpalPlayback::new(name)))
}

#[cfg(not(feature = "device-cpal"))]
fn cpal_playback(spec: DeviceSpec) -> DeviceResult<Box<dyn PlaybackDevice>> {
    Err(DeviceError::Unsupported(format!(
        "sound card {spec} (built without device-cpal)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selectors() {
        assert_eq!("tone".parse::<DeviceSpec>().unwrap(), DeviceSpec::Tone);
        assert_eq!("3".parse::<DeviceSpec>().unwrap(), DeviceSpec::Index(3));
        assert_eq!(
            "/dev/video2".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::V4l2("/dev/video2".to_string())
        );
        assert_eq!(
            "cmd:arecord -f S16_LE -t raw".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::Pipe(PipeEndpoint::Command(vec![
                "arecord".into(),
                "-f".into(),
                "S16_LE".into(),
                "-t".into(),
                "raw".into(),
            ]))
        );
        assert_eq!(
            "USB Mic".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::Cpal("USB Mic".to_string())
        );
        assert!("cmd:".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_display_round_trips_prefixes() {
        for text in ["file:/tmp/a.raw", "v4l2:/dev/video0", "cpal:hw:1", "-"] {
            let spec: DeviceSpec = text.parse().unwrap();
            assert_eq!(spec.to_string(), text);
        }
    }

    #[test]
    fn test_catalog_indexes_are_sequential() {
        let devices = list_devices();
        assert!(devices.iter().any(|d| d.name == "tone"));
        for (i, device) in devices.iter().enumerate() {
            assert_eq!(device.index, i);
        }
    }

    #[test]
    fn test_index_resolves_synthetic_source() {
        let tone = list_devices()
            .into_iter()
            .find(|d| d.name == "tone")
            .unwrap();
        let device = capture_device(&DeviceSpec::Index(tone.index), MediaKind::Audio).unwrap();
        assert_eq!(device.name(), "tone");

        assert!(capture_device(&DeviceSpec::Index(tone.index), MediaKind::Video).is_err());
    }

    #[test]
    fn test_null_is_output_only() {
        assert!(capture_device(&DeviceSpec::Null, MediaKind::Audio).is_err());
        assert!(playback_device(&DeviceSpec::Null, MediaKind::Video).is_ok());
    }
}
