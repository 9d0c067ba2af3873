//! Picture scaler and pixel format converter.
//!
//! Every input layout is expanded to full-resolution YUV 4:4:4 planes,
//! resized bilinearly, and packed into the output layout. RGB conversion
//! uses BT.601 limited-range coefficients.

use avrelay_types::{
    ConversionError, ConversionResult, MediaFormat, MediaFrame, PixelFormat, VideoFormat,
};
use tracing::debug;

/// Full-resolution planar YUV picture.
struct Planes {
    width: usize,
    height: usize,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

/// Converts pictures between dimensions and pixel layouts.
pub struct Scaler {
    input: VideoFormat,
    output: VideoFormat,
}

impl Scaler {
    /// Create a scaler from `input` to `output`.
    pub fn new(input: VideoFormat, output: VideoFormat) -> ConversionResult<Self> {
        for f in [&input, &output] {
            if f.width == 0 || f.height == 0 {
                return Err(ConversionError::Unsupported(format!(
                    "picture size {}x{}",
                    f.width, f.height
                )));
            }
        }

        debug!(
            "Scaler {} -> {}",
            MediaFormat::Video(input),
            MediaFormat::Video(output)
        );

        Ok(Self { input, output })
    }

    /// Input format this scaler is bound to.
    pub fn input(&self) -> VideoFormat {
        self.input
    }

    /// Output format.
    pub fn output(&self) -> VideoFormat {
        self.output
    }

    /// Convert every picture in `frame`.
    pub fn process(&mut self, frame: &MediaFrame) -> ConversionResult<MediaFrame> {
        let expected = MediaFormat::Video(self.input);
        if *frame.format() != expected {
            return Err(ConversionError::FormatMismatch {
                expected,
                actual: *frame.format(),
            });
        }

        let in_size = self.input.picture_size();
        let out_size = self.output.picture_size();
        let mut payload = Vec::with_capacity(out_size * frame.units());

        for picture in frame.payload().chunks_exact(in_size) {
            self.convert_picture(picture, &mut payload);
        }

        Ok(MediaFrame::with_units(
            payload,
            MediaFormat::Video(self.output),
            frame.units(),
            frame.sequence(),
        )?)
    }

    fn convert_picture(&self, src: &[u8], dst: &mut Vec<u8>) {
        let same_size = self.input.width == self.output.width
            && self.input.height == self.output.height;

        if same_size {
            match (self.input.pixel_format, self.output.pixel_format) {
                (a, b) if a == b => {
                    dst.extend_from_slice(src);
                    return;
                }
                (PixelFormat::Rgb24, PixelFormat::Bgr24) | (PixelFormat::Bgr24, PixelFormat::Rgb24) => {
                    for px in src.chunks_exact(3) {
                        dst.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                    return;
                }
                _ => {}
            }
        }

        let planes = unpack(src, self.input.pixel_format, self.input.width, self.input.height);
        let planes = if same_size {
            planes
        } else {
            resize(&planes, self.output.width as usize, self.output.height as usize)
        };
        pack(&planes, self.output.pixel_format, dst);
    }
}

fn unpack(src: &[u8], format: PixelFormat, width: u32, height: u32) -> Planes {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let n = w * h;

    let mut planes = Planes {
        width: w,
        height: h,
        y: vec![0; n],
        u: vec![0; n],
        v: vec![0; n],
    };

    match format {
        PixelFormat::Yuyv422 => {
            let stride = 4 * cw;
            for row in 0..h {
                for col in 0..w {
                    let pair = row * stride + (col / 2) * 4;
                    let i = row * w + col;
                    planes.y[i] = src[pair + (col % 2) * 2];
                    planes.u[i] = src[pair + 1];
                    planes.v[i] = src[pair + 3];
                }
            }
        }
        PixelFormat::Yuv420p => {
            let (y, chroma) = src.split_at(n);
            let (u, v) = chroma.split_at(cw * ch);
            planes.y.copy_from_slice(y);
            for row in 0..h {
                for col in 0..w {
                    let c = (row / 2) * cw + col / 2;
                    planes.u[row * w + col] = u[c];
                    planes.v[row * w + col] = v[c];
                }
            }
        }
        PixelFormat::Nv12 => {
            let (y, uv) = src.split_at(n);
            planes.y.copy_from_slice(y);
            for row in 0..h {
                for col in 0..w {
                    let c = ((row / 2) * cw + col / 2) * 2;
                    planes.u[row * w + col] = uv[c];
                    planes.v[row * w + col] = uv[c + 1];
                }
            }
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let bgr = format == PixelFormat::Bgr24;
            for (i, px) in src.chunks_exact(3).enumerate().take(n) {
                let (r, g, b) = if bgr {
                    (px[2], px[1], px[0])
                } else {
                    (px[0], px[1], px[2])
                };
                let (y, u, v) = rgb_to_yuv(r, g, b);
                planes.y[i] = y;
                planes.u[i] = u;
                planes.v[i] = v;
            }
        }
    }

    planes
}

fn pack(planes: &Planes, format: PixelFormat, dst: &mut Vec<u8>) {
    let w = planes.width;
    let h = planes.height;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    match format {
        PixelFormat::Yuyv422 => {
            for row in 0..h {
                for pair in 0..cw {
                    let c0 = pair * 2;
                    let c1 = (c0 + 1).min(w - 1);
                    let i0 = row * w + c0;
                    let i1 = row * w + c1;
                    dst.push(planes.y[i0]);
                    dst.push(avg(&[planes.u[i0], planes.u[i1]]));
                    dst.push(planes.y[i1]);
                    dst.push(avg(&[planes.v[i0], planes.v[i1]]));
                }
            }
        }
        PixelFormat::Yuv420p => {
            dst.extend_from_slice(&planes.y);
            subsample(&planes.u, w, h, cw, ch, |s| dst.push(s));
            subsample(&planes.v, w, h, cw, ch, |s| dst.push(s));
        }
        PixelFormat::Nv12 => {
            dst.extend_from_slice(&planes.y);
            let mut u = Vec::with_capacity(cw * ch);
            let mut v = Vec::with_capacity(cw * ch);
            subsample(&planes.u, w, h, cw, ch, |s| u.push(s));
            subsample(&planes.v, w, h, cw, ch, |s| v.push(s));
            for (a, b) in u.into_iter().zip(v) {
                dst.push(a);
                dst.push(b);
            }
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let bgr = format == PixelFormat::Bgr24;
            for i in 0..w * h {
                let (r, g, b) = yuv_to_rgb(planes.y[i], planes.u[i], planes.v[i]);
                if bgr {
                    dst.extend_from_slice(&[b, g, r]);
                } else {
                    dst.extend_from_slice(&[r, g, b]);
                }
            }
        }
    }
}

/// Average 2x2 blocks of a full-resolution plane, clamping at the edges.
fn subsample(plane: &[u8], w: usize, h: usize, cw: usize, ch: usize, mut push: impl FnMut(u8)) {
    for crow in 0..ch {
        let r0 = crow * 2;
        let r1 = (r0 + 1).min(h - 1);
        for ccol in 0..cw {
            let c0 = ccol * 2;
            let c1 = (c0 + 1).min(w - 1);
            push(avg(&[
                plane[r0 * w + c0],
                plane[r0 * w + c1],
                plane[r1 * w + c0],
                plane[r1 * w + c1],
            ]));
        }
    }
}

fn avg(values: &[u8]) -> u8 {
    let sum: u32 = values.iter().map(|&v| v as u32).sum();
    let n = values.len() as u32;
    ((sum + n / 2) / n) as u8
}

fn resize(src: &Planes, width: usize, height: usize) -> Planes {
    Planes {
        width,
        height,
        y: resize_plane(&src.y, src.width, src.height, width, height),
        u: resize_plane(&src.u, src.width, src.height, width, height),
        v: resize_plane(&src.v, src.width, src.height, width, height),
    }
}

/// Bilinear resize with pixel centers aligned.
fn resize_plane(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut dst = Vec::with_capacity(dw * dh);
    let sx = sw as f32 / dw as f32;
    let sy = sh as f32 / dh as f32;

    for row in 0..dh {
        let fy = ((row as f32 + 0.5) * sy - 0.5).clamp(0.0, (sh - 1) as f32);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy - y0 as f32;

        for col in 0..dw {
            let fx = ((col as f32 + 0.5) * sx - 0.5).clamp(0.0, (sw - 1) as f32);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let wx = fx - x0 as f32;

            let top = src[y0 * sw + x0] as f32 * (1.0 - wx) + src[y0 * sw + x1] as f32 * wx;
            let bottom = src[y1 * sw + x0] as f32 * (1.0 - wx) + src[y1 * sw + x1] as f32 * wx;
            dst.push((top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8);
        }
    }
    dst
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
