//! Resample stage: arbitrary frame → fixed-shape interleaved RGB u8 tensor.
//!
//! Color conversion lives in [`crate::color`]; the scaling itself is
//! delegated to the `image` crate.

use crate::color;
use crate::types::{FrameRef, PixelFormat, ResizedBuffer, TensorShape};
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("{format} buffer too short: expected {expected}, got {actual}")]
    BufferTooShort {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("empty frame: {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },
    #[error("target shape {0} is not 3-channel RGB")]
    UnsupportedTarget(TensorShape),
}

/// Converts a frame into a [`ResizedBuffer`] of exactly `target.len()` samples.
///
/// Implementations must not retain `frame` past the call.
pub trait Resampler {
    fn resize(
        &mut self,
        frame: &FrameRef<'_>,
        target: TensorShape,
    ) -> Result<ResizedBuffer, ResampleError>;
}

/// Default resampler: color conversion + `image::imageops::resize`.
#[derive(Debug, Clone, Copy)]
pub struct ImageResampler {
    filter: FilterType,
}

impl ImageResampler {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> FilterType {
        self.filter
    }
}

impl Default for ImageResampler {
    fn default() -> Self {
        Self::new(FilterType::Triangle)
    }
}

impl Resampler for ImageResampler {
    fn resize(
        &mut self,
        frame: &FrameRef<'_>,
        target: TensorShape,
    ) -> Result<ResizedBuffer, ResampleError> {
        if target.channels != 3 {
            return Err(ResampleError::UnsupportedTarget(target));
        }
        if target.is_empty() {
            return Err(ResampleError::UnsupportedTarget(target));
        }

        let rgb = color::to_rgb(frame)?;

        let data = if frame.width == target.width && frame.height == target.height {
            rgb
        } else {
            // to_rgb always yields width*height*3 bytes, so from_raw cannot fail here
            let src = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(
                ResampleError::EmptyFrame {
                    width: frame.width,
                    height: frame.height,
                },
            )?;
            imageops::resize(&src, target.width, target.height, self.filter).into_raw()
        };

        ResizedBuffer::new(target, data).map_err(|data| ResampleError::BufferTooShort {
            format: PixelFormat::Rgb24,
            expected: target.len(),
            actual: data.len(),
        })
    }
}

/// Parse a filter name as accepted in configuration.
pub fn parse_filter(name: &str) -> Option<FilterType> {
    match name.trim().to_ascii_lowercase().as_str() {
        "nearest" => Some(FilterType::Nearest),
        "triangle" | "bilinear" => Some(FilterType::Triangle),
        "catmullrom" | "catmull-rom" | "bicubic" => Some(FilterType::CatmullRom),
        "gaussian" => Some(FilterType::Gaussian),
        "lanczos3" | "lanczos" => Some(FilterType::Lanczos3),
        _ => None,
    }
}
