//! Owned frame type and raw buffer helpers.

use facestream_core::{FrameRef, PixelFormat};
use std::time::Duration;

/// A captured frame that outlives the capture callback.
///
/// Only used for one-shot captures; the streaming path hands out borrowed
/// [`FrameRef`]s straight from the mmap buffers.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: Duration,
    pub sequence: u32,
}

impl Frame {
    pub fn view(&self) -> FrameRef<'_> {
        FrameRef {
            data: &self.data,
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    pub fn from_view(frame: &FrameRef<'_>) -> Self {
        Self {
            data: frame.data.to_vec(),
            width: frame.width,
            height: frame.height,
            format: frame.format,
            timestamp: frame.timestamp,
            sequence: frame.sequence,
        }
    }
}

/// Map a V4L2 FourCC to the pipeline's pixel format.
pub fn pixel_format_from_fourcc(fourcc: [u8; 4]) -> PixelFormat {
    match &fourcc {
        b"YUYV" => PixelFormat::Yuyv,
        b"NV12" => PixelFormat::Nv12,
        b"YU12" => PixelFormat::I420,
        b"RGB3" => PixelFormat::Rgb24,
        b"GREY" => PixelFormat::Grey,
        // V4L2 names packed 32-bit formats by little-endian word order.
        b"AR24" | b"XR24" => PixelFormat::Bgra32,
        b"AB24" | b"XB24" => PixelFormat::Rgba32,
        _ => PixelFormat::Unsupported(fourcc),
    }
}

/// Where one plane sits inside a single-planar V4L2 buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plane {
    offset: usize,
    stride: usize,
    row_bytes: usize,
    rows: usize,
}

impl Plane {
    /// Bytes the plane occupies; the last row may omit its padding.
    fn span(&self) -> usize {
        match self.rows {
            0 => 0,
            rows => self.stride * (rows - 1) + self.row_bytes,
        }
    }
}

/// Byte layout of a captured buffer as reported by the driver.
///
/// `stride` is `bytesperline` for the first plane. Planar YUV formats put
/// their chroma planes after the luma plane with the stride V4L2 implies
/// (same stride for NV12's interleaved UV, half of it for I420's U and V).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl BufferLayout {
    /// Bytes per row of the first plane when tightly packed.
    pub fn tight_stride(&self) -> Option<usize> {
        let w = self.width as usize;
        match self.format {
            PixelFormat::Rgb24 => Some(w * 3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(w * 4),
            PixelFormat::Grey | PixelFormat::Nv12 | PixelFormat::I420 => Some(w),
            PixelFormat::Yuyv => Some(w.div_ceil(2) * 4),
            PixelFormat::Unsupported(_) => None,
        }
    }

    /// True when rows carry driver padding that must be stripped.
    pub fn is_padded(&self) -> bool {
        self.tight_stride().is_some_and(|tight| self.stride > tight)
    }

    fn planes(&self) -> Option<([Plane; 3], usize)> {
        let tight = self.tight_stride()?;
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let luma = Plane {
            offset: 0,
            stride: self.stride,
            row_bytes: tight,
            rows: h,
        };
        let empty = Plane {
            offset: 0,
            stride: 0,
            row_bytes: 0,
            rows: 0,
        };
        let chroma_base = self.stride * h;

        Some(match self.format {
            PixelFormat::Nv12 => {
                let uv = Plane {
                    offset: chroma_base,
                    stride: self.stride,
                    row_bytes: cw * 2,
                    rows: ch,
                };
                ([luma, uv, empty], 2)
            }
            PixelFormat::I420 => {
                let chroma_stride = self.stride / 2;
                let u = Plane {
                    offset: chroma_base,
                    stride: chroma_stride,
                    row_bytes: cw,
                    rows: ch,
                };
                let v = Plane {
                    offset: chroma_base + chroma_stride * ch,
                    ..u
                };
                ([luma, u, v], 3)
            }
            _ => ([luma, empty, empty], 1),
        })
    }

    /// Copy the visible pixels of every plane out of `src` into `out`.
    ///
    /// Reuses `out` to avoid a per-frame allocation. On failure (unsupported
    /// format, stride narrower than a row, or `src` too short) `out` is left
    /// empty and false is returned.
    pub fn repack(&self, src: &[u8], out: &mut Vec<u8>) -> bool {
        out.clear();
        let Some((planes, count)) = self.planes() else {
            return false;
        };
        let planes = &planes[..count];

        let fits = planes.iter().all(|p| {
            p.rows > 0 && p.stride >= p.row_bytes && src.len() >= p.offset + p.span()
        });
        if !fits {
            return false;
        }

        for plane in planes {
            for row in 0..plane.rows {
                let start = plane.offset + row * plane.stride;
                out.extend_from_slice(&src[start..start + plane.row_bytes]);
            }
        }
        true
    }
}
