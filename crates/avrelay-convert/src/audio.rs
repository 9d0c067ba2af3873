//! Streaming audio resampler.

use std::borrow::Cow;

use avrelay_types::{
    AudioFormat, ConversionError, ConversionResult, MediaFormat, MediaFrame, SampleFormat,
};
use tracing::debug;

/// Converts sample format, channel layout and sample rate of an audio stream.
///
/// Rate conversion is linear interpolation over a continuous stream: the
/// fractional read position and the last input sample carry over between
/// calls, so chunk boundaries neither drop nor repeat samples.
pub struct Resampler {
    input: AudioFormat,
    output: AudioFormat,
    step: f64,
    pos: f64,
    last: Option<Vec<f32>>,
}

impl Resampler {
    /// Create a resampler from `input` to `output`.
    pub fn new(input: AudioFormat, output: AudioFormat) -> ConversionResult<Self> {
        if input.channels == 0 || output.channels == 0 {
            return Err(ConversionError::Unsupported(
                "audio with zero channels".to_string(),
            ));
        }
        if input.sample_rate == 0 || output.sample_rate == 0 {
            return Err(ConversionError::Unsupported(
                "audio with zero sample rate".to_string(),
            ));
        }

        debug!(
            "Resampler {} -> {}",
            MediaFormat::Audio(input),
            MediaFormat::Audio(output)
        );

        Ok(Self {
            input,
            output,
            step: input.sample_rate as f64 / output.sample_rate as f64,
            pos: 0.0,
            last: None,
        })
    }

    /// Input format this resampler is bound to.
    pub fn input(&self) -> AudioFormat {
        self.input
    }

    /// Output format.
    pub fn output(&self) -> AudioFormat {
        self.output
    }

    /// Input samples held back for continuity with the next call.
    pub fn delay(&self) -> f64 {
        if self.last.is_some() {
            (1.0 - self.pos).max(0.0)
        } else {
            0.0
        }
    }

    /// Convert one frame.
    pub fn process(&mut self, frame: &MediaFrame) -> ConversionResult<MediaFrame> {
        let expected = MediaFormat::Audio(self.input);
        if *frame.format() != expected {
            return Err(ConversionError::FormatMismatch {
                expected,
                actual: *frame.format(),
            });
        }

        let in_channels = self.input.channels as usize;
        let out_channels = self.output.channels as usize;

        let samples = decode_samples(frame.payload(), self.input.sample_format, in_channels);
        let mixed = remix(&samples, in_channels, out_channels);
        let resampled = if self.input.sample_rate == self.output.sample_rate {
            mixed
        } else {
            self.interpolate(&mixed)
        };

        self.emit(&resampled, frame.sequence())
    }

    /// Emit the held-back tail and reset the stream position.
    pub fn flush(&mut self, sequence: u64) -> ConversionResult<Option<MediaFrame>> {
        let Some(last) = self.last.take() else {
            self.pos = 0.0;
            return Ok(None);
        };

        let mut tail = Vec::new();
        while self.pos < 1.0 {
            tail.extend_from_slice(&last);
            self.pos += self.step;
        }
        self.pos = 0.0;

        if tail.is_empty() {
            return Ok(None);
        }
        self.emit(&tail, sequence).map(Some)
    }

    fn emit(&self, samples: &[f32], sequence: u64) -> ConversionResult<MediaFrame> {
        let channels = self.output.channels as usize;
        let units = samples.len() / channels;
        let payload = encode_samples(samples, self.output.sample_format, channels);
        Ok(MediaFrame::with_units(
            payload,
            MediaFormat::Audio(self.output),
            units,
            sequence,
        )?)
    }

    fn interpolate(&mut self, input: &[f32]) -> Vec<f32> {
        let ch = self.output.channels as usize;
        let n = input.len() / ch;
        if n == 0 {
            return Vec::new();
        }

        // Position 0 is the last sample of the previous call. On the first
        // call it is the first sample itself and reading starts at 1.
        let last = match self.last.take() {
            Some(last) => last,
            None => {
                self.pos = 1.0;
                input[..ch].to_vec()
            }
        };
        let at = |i: usize, c: usize| {
            if i == 0 {
                last[c]
            } else {
                input[(i - 1) * ch + c]
            }
        };

        let mut out = Vec::with_capacity((n as f64 / self.step) as usize * ch + 2 * ch);
        while self.pos < n as f64 {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            for c in 0..ch {
                let a = at(i, c);
                let b = at(i + 1, c);
                out.push(a + (b - a) * frac);
            }
            self.pos += self.step;
        }

        self.pos -= n as f64;
        self.last = Some(input[(n - 1) * ch..n * ch].to_vec());
        out
    }
}

/// Decode raw bytes into interleaved f32 samples.
pub fn decode_samples(bytes: &[u8], format: SampleFormat, channels: usize) -> Vec<f32> {
    let width = format.bytes_per_sample();
    let raw: Vec<f32> = bytes
        .chunks_exact(width)
        .map(|b| read_sample(b, format))
        .collect();

    if format.is_planar() && channels > 1 {
        let frames = raw.len() / channels;
        let mut out = Vec::with_capacity(raw.len());
        for f in 0..frames {
            for c in 0..channels {
                out.push(raw[c * frames + f]);
            }
        }
        out
    } else {
        raw
    }
}

/// Encode interleaved f32 samples into raw bytes.
pub fn encode_samples(samples: &[f32], format: SampleFormat, channels: usize) -> Vec<u8> {
    let ordered: Cow<'_, [f32]> = if format.is_planar() && channels > 1 {
        let frames = samples.len() / channels;
        let mut planes = Vec::with_capacity(samples.len());
        for c in 0..channels {
            for f in 0..frames {
                planes.push(samples[f * channels + c]);
            }
        }
        Cow::Owned(planes)
    } else {
        Cow::Borrowed(samples)
    };

    let mut out = Vec::with_capacity(ordered.len() * format.bytes_per_sample());
    for &s in ordered.iter() {
        write_sample(&mut out, s, format);
    }
    out
}

fn read_sample(b: &[u8], format: SampleFormat) -> f32 {
    match format {
        SampleFormat::U8 => (b[0] as f32 - 128.0) / 128.0,
        SampleFormat::S16 | SampleFormat::S16P => i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0,
        SampleFormat::S32 => {
            (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / 2_147_483_648.0) as f32
        }
        SampleFormat::F32 | SampleFormat::F32P => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    }
}

fn write_sample(out: &mut Vec<u8>, s: f32, format: SampleFormat) {
    match format {
        SampleFormat::U8 => {
            out.push((s * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8);
        }
        SampleFormat::S16 | SampleFormat::S16P => {
            let v = (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleFormat::S32 => {
            let v = (s as f64 * 2_147_483_648.0)
                .round()
                .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleFormat::F32 | SampleFormat::F32P => out.extend_from_slice(&s.to_le_bytes()),
    }
}

/// Map interleaved samples from one channel count to another.
///
/// Mono is duplicated on up-mix and is the average on down-mix; otherwise
/// down-mix averages input channels congruent to each output channel and
/// up-mix repeats input channels cyclically.
fn remix(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        for oc in 0..to {
            let v = if from == 1 {
                frame[0]
            } else if to == 1 {
                frame.iter().sum::<f32>() / from as f32
            } else if from > to {
                let (sum, count) = frame
                    .iter()
                    .enumerate()
                    .filter(|(ic, _)| ic % to == oc)
                    .fold((0.0f32, 0usize), |(s, n), (_, v)| (s + v, n + 1));
                sum / count as f32
            } else {
                frame[oc % from]
            };
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_frame(samples: &[f32], format: AudioFormat, sequence: u64) -> MediaFrame {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        MediaFrame::new(bytes, MediaFormat::Audio(format), sequence).unwrap()
    }

    fn f32_samples(frame: &MediaFrame) -> Vec<f32> {
        frame
            .payload()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let input = AudioFormat::new(SampleFormat::S16, 1, 48000);
        let output = AudioFormat::new(SampleFormat::S16, 2, 48000);
        let mut resampler = Resampler::new(input, output).unwrap();

        let bytes: Vec<u8> = [100i16, -200].iter().flat_map(|s| s.to_le_bytes()).collect();
        let frame = MediaFrame::new(bytes, MediaFormat::Audio(input), 0).unwrap();
        let out = resampler.process(&frame).unwrap();

        let values: Vec<i16> = out
            .payload()
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![100, 100, -200, -200]);
        assert_eq!(out.units(), 2);
    }

    #[test]
    fn test_stereo_to_planar_float() {
        let input = AudioFormat::new(SampleFormat::S16, 2, 44100);
        let output = AudioFormat::new(SampleFormat::F32P, 2, 44100);
        let mut resampler = Resampler::new(input, output).unwrap();

        let bytes: Vec<u8> = [16384i16, -16384, 8192, -8192]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let frame = MediaFrame::new(bytes, MediaFormat::Audio(input), 0).unwrap();
        let out = resampler.process(&frame).unwrap();

        assert_eq!(f32_samples(&out), vec![0.5, 0.25, -0.5, -0.25]);
    }

    #[test]
    fn test_downsample_is_continuous_across_calls() {
        let input = AudioFormat::new(SampleFormat::F32, 1, 48000);
        let output = AudioFormat::new(SampleFormat::F32, 1, 32000);
        let mut resampler = Resampler::new(input, output).unwrap();

        let ramp: Vec<f32> = (0..60).map(|i| i as f32).collect();
        let mut produced = Vec::new();
        let mut start = 0;
        for (seq, len) in [7usize, 13, 1, 20, 19].into_iter().enumerate() {
            let frame = f32_frame(&ramp[start..start + len], input, seq as u64);
            produced.extend(f32_samples(&resampler.process(&frame).unwrap()));
            start += len;
        }

        // Every output sample lies on the ramp at 1.5 input samples per step.
        for (k, v) in produced.iter().enumerate() {
            assert!((v - 1.5 * k as f32).abs() < 1e-3, "sample {k} = {v}");
        }

        let tail = resampler.flush(99).unwrap().map(|f| f32_samples(&f));
        let total = produced.len() + tail.map(|t| t.len()).unwrap_or(0);
        assert_eq!(total, 40);
    }

    #[test]
    fn test_upsample_preserves_duration() {
        let input = AudioFormat::new(SampleFormat::S16, 2, 22050);
        let output = AudioFormat::new(SampleFormat::S16, 2, 44100);
        let mut resampler = Resampler::new(input, output).unwrap();

        let mut units = 0;
        for seq in 0..10 {
            let frame = MediaFrame::with_units(vec![0u8; 441 * 4], MediaFormat::Audio(input), 441, seq)
                .unwrap();
            units += resampler.process(&frame).unwrap().units();
        }
        if let Some(tail) = resampler.flush(10).unwrap() {
            units += tail.units();
        }
        assert_eq!(units, 8820);
    }

    #[test]
    fn test_format_mismatch_is_rejected() {
        let input = AudioFormat::new(SampleFormat::S16, 2, 48000);
        let mut resampler = Resampler::new(input, input).unwrap();

        let other = AudioFormat::new(SampleFormat::S16, 1, 48000);
        let frame = MediaFrame::new(vec![0u8; 4], MediaFormat::Audio(other), 0).unwrap();
        assert!(matches!(
            resampler.process(&frame),
            Err(ConversionError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_downmix_averages() {
        assert_eq!(remix(&[1.0, 0.0, 0.5, 0.5], 2, 1), vec![0.5, 0.5]);
        assert_eq!(
            remix(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 6, 2),
            vec![3.0, 4.0]
        );
    }
}
