//! Device-native pixel formats → packed RGB.
//!
//! YUV sources use integer BT.601 limited-range coefficients, which is what
//! V4L2 webcams and mobile camera HALs emit by default.

use crate::resample::ResampleError;
use crate::types::{FrameRef, PixelFormat};

/// Convert a frame to tightly packed 8-bit RGB (`width * height * 3` bytes).
pub fn to_rgb(frame: &FrameRef<'_>) -> Result<Vec<u8>, ResampleError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w == 0 || h == 0 {
        return Err(ResampleError::EmptyFrame {
            width: frame.width,
            height: frame.height,
        });
    }

    let expected = frame
        .format
        .required_len(frame.width, frame.height)
        .ok_or(ResampleError::UnsupportedFormat(frame.format))?;
    if frame.data.len() < expected {
        return Err(ResampleError::BufferTooShort {
            format: frame.format,
            expected,
            actual: frame.data.len(),
        });
    }

    let src = &frame.data[..expected];
    let rgb = match frame.format {
        PixelFormat::Rgb24 => src.to_vec(),
        PixelFormat::Rgba32 => swizzle4(src, [0, 1, 2]),
        PixelFormat::Bgra32 => swizzle4(src, [2, 1, 0]),
        PixelFormat::Grey => src.iter().flat_map(|&y| [y, y, y]).collect(),
        PixelFormat::Yuyv => yuyv_to_rgb(src, w, h),
        PixelFormat::Nv12 => nv12_to_rgb(src, w, h),
        PixelFormat::I420 => i420_to_rgb(src, w, h),
        PixelFormat::Unsupported(_) => {
            return Err(ResampleError::UnsupportedFormat(frame.format))
        }
    };
    Ok(rgb)
}

/// Pick three channels out of every 4-byte pixel.
fn swizzle4(src: &[u8], order: [usize; 3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 4 * 3);
    for px in src.chunks_exact(4) {
        out.extend_from_slice(&[px[order[0]], px[order[1]], px[order[2]]]);
    }
    out
}

/// BT.601 limited range, 8.8 fixed point.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

fn yuyv_to_rgb(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let stride = w.div_ceil(2) * 4;
    let mut out = Vec::with_capacity(w * h * 3);
    for row in src.chunks_exact(stride).take(h) {
        for x in 0..w {
            let pair = (x / 2) * 4;
            let y = row[pair + (x % 2) * 2];
            out.extend_from_slice(&yuv_to_rgb(y, row[pair + 1], row[pair + 3]));
        }
    }
    out
}

fn nv12_to_rgb(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let (luma, chroma) = src.split_at(w * h);
    let uv_stride = w.div_ceil(2) * 2;
    let mut out = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let uv_row = (y / 2) * uv_stride;
        for x in 0..w {
            let uv = uv_row + (x / 2) * 2;
            out.extend_from_slice(&yuv_to_rgb(luma[y * w + x], chroma[uv], chroma[uv + 1]));
        }
    }
    out
}

fn i420_to_rgb(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let (luma, chroma) = src.split_at(w * h);
    let (u_plane, v_plane) = chroma.split_at(cw * ch);
    let mut out = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let c = (y / 2) * cw + x / 2;
            out.extend_from_slice(&yuv_to_rgb(luma[y * w + x], u_plane[c], v_plane[c]));
        }
    }
    out
}
