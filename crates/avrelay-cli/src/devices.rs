//! Device listing and interactive selection.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{bail, Context, Result};
use avrelay_codec::available_codecs;
use avrelay_device::{list_devices, list_matching, DeviceSpec};
use avrelay_types::{DeviceDirection, DeviceInfo, MediaKind};

fn direction_name(direction: DeviceDirection) -> &'static str {
    match direction {
        DeviceDirection::Input => "capture",
        DeviceDirection::Output => "playback",
    }
}

/// One line per device: index, direction, kind, name and capabilities.
pub fn describe(info: &DeviceInfo) -> String {
    let mut line = format!(
        "{:>3}  {:<8} {:<5} {}",
        info.index,
        direction_name(info.direction),
        info.kind.name(),
        info.name
    );
    if info.is_default {
        line.push_str(" (default)");
    }
    if info.max_channels > 0 {
        line.push_str(&format!(", up to {} channels", info.max_channels));
    }
    if !info.formats.is_empty() {
        let formats: Vec<String> = info.formats.iter().map(ToString::to_string).collect();
        line.push_str(&format!(", formats: {}", formats.join("; ")));
    }
    line
}

/// Print every device, optionally only those of `kind`.
pub fn print_devices(kind: Option<MediaKind>) {
    let devices: Vec<DeviceInfo> = list_devices()
        .into_iter()
        .filter(|d| kind.map_or(true, |k| d.kind == k))
        .collect();

    if devices.is_empty() {
        println!("No devices found");
    }
    for info in &devices {
        println!("{}", describe(info));
    }

    println!();
    for (codec, encode, decode) in available_codecs() {
        println!("codec {:<5} encode: {:<3} decode: {}", codec.name(), yes_no(encode), yes_no(decode));
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Resolve the device to open. An explicit selector wins; otherwise the
/// user picks from a list when stdin is a terminal, and the default device
/// is used when it is not.
pub fn select_device(
    selector: Option<&str>,
    direction: DeviceDirection,
    kind: MediaKind,
) -> Result<DeviceSpec> {
    if let Some(selector) = selector {
        return selector
            .parse()
            .with_context(|| format!("Invalid device selector '{selector}'"));
    }

    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(DeviceSpec::Default);
    }

    let candidates = list_matching(direction, kind);
    if candidates.is_empty() {
        return Ok(DeviceSpec::Default);
    }

    let mut stderr = io::stderr();
    writeln!(stderr, "Available {} {} devices:", kind.name(), direction_name(direction))?;
    for info in &candidates {
        writeln!(stderr, "{}", describe(info))?;
    }
    write!(stderr, "Select a device index (empty for default): ")?;
    stderr.flush()?;

    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    parse_choice(&answer, &candidates)
}

fn parse_choice(answer: &str, candidates: &[DeviceInfo]) -> Result<DeviceSpec> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(DeviceSpec::Default);
    }
    let index: usize = answer
        .parse()
        .with_context(|| format!("'{answer}' is not a device index"))?;
    if !candidates.iter().any(|d| d.index == index) {
        bail!("No matching device with index {index}");
    }
    Ok(DeviceSpec::Index(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(index: usize) -> DeviceInfo {
        DeviceInfo {
            index,
            name: "tone".to_string(),
            direction: DeviceDirection::Input,
            kind: MediaKind::Audio,
            max_channels: 8,
            formats: Vec::new(),
            is_default: false,
        }
    }

    #[test]
    fn test_parse_choice() {
        let candidates = vec![info(2), info(5)];
        assert_eq!(parse_choice("\n", &candidates).unwrap(), DeviceSpec::Default);
        assert_eq!(parse_choice(" 5\n", &candidates).unwrap(), DeviceSpec::Index(5));
        assert!(parse_choice("3", &candidates).is_err());
        assert!(parse_choice("mic", &candidates).is_err());
    }

    #[test]
    fn test_explicit_selector_wins() {
        let spec = select_device(Some("tone"), DeviceDirection::Input, MediaKind::Audio).unwrap();
        assert_eq!(spec, DeviceSpec::Tone);
    }

    #[test]
    fn test_describe_line() {
        let line = describe(&info(2));
        assert!(line.contains("capture"));
        assert!(line.contains("tone"));
        assert!(line.contains("up to 8 channels"));
    }
}
