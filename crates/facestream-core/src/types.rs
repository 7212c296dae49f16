use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Device-native pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 8-bit RGB (3 bytes/pixel).
    Rgb24,
    /// Packed 8-bit RGBA (4 bytes/pixel, alpha ignored).
    Rgba32,
    /// Packed 8-bit BGRA (4 bytes/pixel, alpha ignored).
    Bgra32,
    /// 8-bit luma only.
    Grey,
    /// YUYV 4:2:2 packed: [Y0, U, Y1, V] per pixel pair.
    Yuyv,
    /// Y plane followed by an interleaved UV plane at 2x2 subsampling.
    Nv12,
    /// Y plane followed by separate U and V planes at 2x2 subsampling.
    I420,
    /// Any other device FourCC (MJPG, H264, ...). Carried through so the
    /// resample stage can reject it per frame.
    Unsupported([u8; 4]),
}

impl PixelFormat {
    /// Minimum buffer length for a `width`×`height` frame in this format.
    ///
    /// Returns `None` for formats whose size is not a function of the
    /// dimensions.
    pub fn required_len(self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        match self {
            PixelFormat::Rgb24 => Some(w * h * 3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(w * h * 4),
            PixelFormat::Grey => Some(w * h),
            PixelFormat::Yuyv => Some(w.div_ceil(2) * 4 * h),
            PixelFormat::Nv12 | PixelFormat::I420 => Some(w * h + 2 * chroma),
            PixelFormat::Unsupported(_) => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgb24 => f.write_str("RGB24"),
            PixelFormat::Rgba32 => f.write_str("RGBA32"),
            PixelFormat::Bgra32 => f.write_str("BGRA32"),
            PixelFormat::Grey => f.write_str("GREY"),
            PixelFormat::Yuyv => f.write_str("YUYV"),
            PixelFormat::Nv12 => f.write_str("NV12"),
            PixelFormat::I420 => f.write_str("I420"),
            PixelFormat::Unsupported(fourcc) => {
                write!(f, "unsupported({})", String::from_utf8_lossy(fourcc))
            }
        }
    }
}

/// Borrowed, read-only view of one captured frame.
///
/// The lifetime ties the view to the callback that delivers it; the pixel
/// data belongs to the frame source and is never retained by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture time relative to the start of the stream.
    pub timestamp: Duration,
    pub sequence: u32,
}

/// Shape of an interleaved (HWC) image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl TensorShape {
    /// Face embedding networks in this family take 112×112 RGB crops.
    pub const FACE_112_RGB: TensorShape = TensorShape {
        width: 112,
        height: 112,
        channels: 3,
    };

    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of samples in a buffer of this shape.
    pub const fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Resampled frame: unsigned 8-bit interleaved RGB at the model input size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizedBuffer {
    shape: TensorShape,
    data: Vec<u8>,
}

impl ResizedBuffer {
    /// Wrap `data`, returning it back if its length does not match `shape`.
    pub fn new(shape: TensorShape, data: Vec<u8>) -> Result<Self, Vec<u8>> {
        if data.len() != shape.len() {
            return Err(data);
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Model input: signed 8-bit samples with the same shape and interleaving
/// as the [`ResizedBuffer`] it was produced from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedBuffer {
    shape: TensorShape,
    data: Vec<i8>,
}

impl QuantizedBuffer {
    pub(crate) fn from_parts(shape: TensorShape, data: Vec<i8>) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Self { shape, data }
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn as_slice(&self) -> &[i8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Affine quantization parameters: `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Raw 0–255 pixel values shifted into int8: `q = v - 128`.
    pub const PIXEL_SHIFT: QuantParams = QuantParams {
        scale: 1.0,
        zero_point: -128,
    };

    /// Real value represented by the quantized sample `q`.
    pub fn dequantize(&self, q: i8) -> f32 {
        self.scale * (q as i32 - self.zero_point) as f32
    }

    pub fn is_pixel_shift(&self) -> bool {
        *self == Self::PIXEL_SHIFT
    }
}

impl Default for QuantParams {
    fn default() -> Self {
        Self::PIXEL_SHIFT
    }
}

/// Face embedding vector (L2-normalized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Scale `values` to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
