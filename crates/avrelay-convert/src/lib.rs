//! Format conversion between pipeline stages.
//!
//! [`FrameConverter`] picks an audio [`Resampler`], a video [`Scaler`] or a
//! passthrough for a pair of formats. The input side may be left unbound and
//! is then taken from the first frame.

mod audio;
mod video;

pub use audio::{decode_samples, encode_samples, Resampler};
pub use video::Scaler;

use avrelay_types::{ConversionError, ConversionResult, MediaFormat, MediaFrame};
use tracing::{debug, instrument};

enum Stage {
    Passthrough(MediaFormat),
    Audio(Resampler),
    Video(Scaler),
}

impl Stage {
    fn build(input: MediaFormat, output: MediaFormat) -> ConversionResult<Self> {
        if input == output {
            return Ok(Self::Passthrough(input));
        }

        match (input, output) {
            (MediaFormat::Audio(i), MediaFormat::Audio(o)) => Ok(Self::Audio(Resampler::new(i, o)?)),
            (MediaFormat::Video(i), MediaFormat::Video(o)) => Ok(Self::Video(Scaler::new(i, o)?)),
            _ => Err(ConversionError::KindMismatch {
                from: input.kind(),
                to: output.kind(),
            }),
        }
    }

    fn input(&self) -> MediaFormat {
        match self {
            Self::Passthrough(f) => *f,
            Self::Audio(r) => MediaFormat::Audio(r.input()),
            Self::Video(s) => MediaFormat::Video(s.input()),
        }
    }
}

/// Converts raw frames into a fixed output format.
pub struct FrameConverter {
    output: MediaFormat,
    stage: Option<Stage>,
}

impl FrameConverter {
    /// Create a converter. With `input` unset the converter binds to the
    /// format of the first frame it sees.
    #[instrument(name = "converter_new", skip_all, fields(output = %output))]
    pub fn new(input: Option<MediaFormat>, output: MediaFormat) -> ConversionResult<Self> {
        let stage = input.map(|i| Stage::build(i, output)).transpose()?;
        if stage.is_none() && !output.is_complete() {
            return Err(ConversionError::Unsupported(format!(
                "incomplete output format {output}"
            )));
        }
        Ok(Self { output, stage })
    }

    /// Output format.
    pub fn output_format(&self) -> MediaFormat {
        self.output
    }

    /// Bound input format, if any.
    pub fn input_format(&self) -> Option<MediaFormat> {
        self.stage.as_ref().map(Stage::input)
    }

    /// Returns true if frames pass through unchanged.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.stage, Some(Stage::Passthrough(_)))
    }

    /// Audio input held back for continuity, in input samples.
    pub fn delay(&self) -> f64 {
        match &self.stage {
            Some(Stage::Audio(r)) => r.delay(),
            _ => 0.0,
        }
    }

    /// Convert one frame into the output format.
    pub fn convert(&mut self, frame: MediaFrame) -> ConversionResult<MediaFrame> {
        if self.stage.is_none() {
            debug!("Binding converter input to {}", frame.format());
            self.stage = Some(Stage::build(*frame.format(), self.output)?);
        }

        match self.stage.as_mut() {
            Some(Stage::Passthrough(expected)) => {
                if frame.format() != expected {
                    return Err(ConversionError::FormatMismatch {
                        expected: *expected,
                        actual: *frame.format(),
                    });
                }
                Ok(frame)
            }
            Some(Stage::Audio(r)) => r.process(&frame),
            Some(Stage::Video(s)) => s.process(&frame),
            None => Err(ConversionError::Unsupported("converter not bound".to_string())),
        }
    }

    /// Emit any buffered tail. Only audio rate conversion holds data back.
    pub fn flush(&mut self, sequence: u64) -> ConversionResult<Option<MediaFrame>> {
        match self.stage.as_mut() {
            Some(Stage::Audio(r)) => r.flush(sequence),
            _ => Ok(None),
        }
    }
}
