//! Quantization stage: unsigned 8-bit pixels → signed 8-bit model input.
//!
//! The default mapping is the two's-complement shift `q = v - 128`
//! (0 → -128, 128 → 0, 255 → 127). Models that declare other input
//! parameters go through a 256-entry table built once at load time, so the
//! per-frame pass is a single linear sweep either way.

use crate::types::{QuantParams, QuantizedBuffer, ResizedBuffer};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum QuantError {
    #[error("invalid quantization scale {0} (must be finite and > 0)")]
    InvalidScale(f32),
    #[error("zero point {0} outside the int8 range")]
    ZeroPointOutOfRange(i32),
}

/// Shift one sample into the signed domain with 8-bit wraparound.
#[inline(always)]
pub fn quantize(v: u8) -> i8 {
    v.wrapping_sub(128) as i8
}

/// Inverse of [`quantize`].
#[inline(always)]
pub fn dequantize(q: i8) -> u8 {
    (q as u8).wrapping_add(128)
}

/// Apply [`quantize`] to every sample. Allocates only the output buffer.
pub fn quantize_buffer(input: &ResizedBuffer) -> QuantizedBuffer {
    let data: Vec<i8> = input.as_slice().iter().map(|&v| quantize(v)).collect();
    QuantizedBuffer::from_parts(input.shape(), data)
}

/// Per-model requantizer derived from the model's declared input parameters.
#[derive(Clone)]
pub enum Requantizer {
    /// `q = v - 128`.
    Shift,
    /// `q = table[v]`.
    Table(Box<[i8; 256]>),
}

impl Requantizer {
    /// Build the requantizer for `params`.
    ///
    /// `(scale = 1.0, zero_point = -128)` is the plain shift. Anything else
    /// maps `q = clamp(round(v / scale) + zero_point, -128, 127)`.
    pub fn from_params(params: QuantParams) -> Result<Self, QuantError> {
        if !params.scale.is_finite() || params.scale <= 0.0 {
            return Err(QuantError::InvalidScale(params.scale));
        }
        if !(i8::MIN as i32..=i8::MAX as i32).contains(&params.zero_point) {
            return Err(QuantError::ZeroPointOutOfRange(params.zero_point));
        }
        if params.is_pixel_shift() {
            return Ok(Requantizer::Shift);
        }

        let mut table = Box::new([0i8; 256]);
        for (v, slot) in table.iter_mut().enumerate() {
            let q = (v as f32 / params.scale).round() as i32 + params.zero_point;
            *slot = q.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        }
        Ok(Requantizer::Table(table))
    }

    #[inline]
    pub fn map(&self, v: u8) -> i8 {
        match self {
            Requantizer::Shift => quantize(v),
            Requantizer::Table(table) => table[v as usize],
        }
    }

    /// Requantize a whole buffer in one pass.
    pub fn apply(&self, input: &ResizedBuffer) -> QuantizedBuffer {
        match self {
            Requantizer::Shift => quantize_buffer(input),
            Requantizer::Table(table) => {
                let data = input.as_slice().iter().map(|&v| table[v as usize]).collect();
                QuantizedBuffer::from_parts(input.shape(), data)
            }
        }
    }
}

impl std::fmt::Debug for Requantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requantizer::Shift => f.write_str("Requantizer::Shift"),
            Requantizer::Table(_) => f.write_str("Requantizer::Table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorShape;

    fn buffer(data: &[u8]) -> ResizedBuffer {
        ResizedBuffer::new(TensorShape::new(data.len() as u32, 1, 1), data.to_vec()).unwrap()
    }

    #[test]
    fn test_scalar_law_all_values() {
        for v in 0..=255u8 {
            let expected = ((v as i32 - 128 + 256) % 256) - 128;
            assert_eq!(quantize(v) as i32, expected, "v={v}");
        }
    }

    #[test]
    fn test_anchor_values() {
        assert_eq!(quantize(0), -128);
        assert_eq!(quantize(128), 0);
        assert_eq!(quantize(255), 127);
    }

    #[test]
    fn test_bijection() {
        let mut seen = [false; 256];
        for v in 0..=255u8 {
            let idx = (quantize(v) as i32 + 128) as usize;
            assert!(!seen[idx], "collision at v={v}");
            seen[idx] = true;
        }
        assert!(seen.iter().all(|&s| s), "every int8 value must be reached");
    }

    #[test]
    fn test_round_trip() {
        for v in 0..=255u8 {
            assert_eq!(dequantize(quantize(v)), v);
        }
    }

    #[test]
    fn test_buffer_scenario() {
        let out = quantize_buffer(&buffer(&[0, 128, 255, 64, 200]));
        assert_eq!(out.as_slice(), &[-128, 0, 127, -64, 72]);
    }

    #[test]
    fn test_buffer_elementwise_full_frame() {
        let data: Vec<u8> = (0..TensorShape::FACE_112_RGB.len()).map(|i| (i * 31 % 256) as u8).collect();
        let input = ResizedBuffer::new(TensorShape::FACE_112_RGB, data.clone()).unwrap();
        let out = quantize_buffer(&input);
        assert_eq!(out.len(), data.len());
        assert_eq!(out.shape(), TensorShape::FACE_112_RGB);
        for (v, q) in data.iter().zip(out.as_slice()) {
            assert_eq!(*q, quantize(*v));
        }
    }

    #[test]
    fn test_empty_buffer() {
        assert!(quantize_buffer(&buffer(&[])).is_empty());
    }

    #[test]
    fn test_default_params_are_shift() {
        let r = Requantizer::from_params(QuantParams::default()).unwrap();
        assert!(matches!(r, Requantizer::Shift));
        for v in 0..=255u8 {
            assert_eq!(r.map(v), quantize(v));
        }
    }

    #[test]
    fn test_table_matches_explicit_params() {
        // Symmetric int8 input: real = (q - 0) * 2.0 → q = round(v / 2)
        let r = Requantizer::from_params(QuantParams { scale: 2.0, zero_point: 0 }).unwrap();
        assert_eq!(r.map(0), 0);
        assert_eq!(r.map(101), 51);
        assert_eq!(r.map(254), 127);
        assert_eq!(r.map(255), 127);
    }

    #[test]
    fn test_table_saturates_instead_of_wrapping() {
        let r = Requantizer::from_params(QuantParams { scale: 1.0, zero_point: 0 }).unwrap();
        assert_eq!(r.map(127), 127);
        assert_eq!(r.map(200), 127);
    }

    #[test]
    fn test_apply_uses_table() {
        let r = Requantizer::from_params(QuantParams { scale: 1.0, zero_point: -100 }).unwrap();
        let out = r.apply(&buffer(&[0, 100, 255]));
        assert_eq!(out.as_slice(), &[-100, 0, 127]);
    }

    #[test]
    fn test_invalid_params() {
        assert_eq!(
            Requantizer::from_params(QuantParams { scale: 0.0, zero_point: 0 }).unwrap_err(),
            QuantError::InvalidScale(0.0)
        );
        assert!(Requantizer::from_params(QuantParams { scale: f32::NAN, zero_point: 0 }).is_err());
        assert_eq!(
            Requantizer::from_params(QuantParams { scale: 1.0, zero_point: 200 }).unwrap_err(),
            QuantError::ZeroPointOutOfRange(200)
        );
    }
}
