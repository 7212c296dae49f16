//! facestream-core: real-time face embedding pipeline.
//!
//! Each camera frame is resampled to the model's input shape, requantized
//! from unsigned to signed 8-bit, and run synchronously through a quantized
//! network via ONNX Runtime. Per-frame failures are contained; only a failed
//! model load is surfaced, once.

pub mod color;
pub mod invoker;
pub mod model;
pub mod onnx;
pub mod pipeline;
pub mod quantize;
pub mod resample;
pub mod types;

pub use model::{InferenceError, LoadError, Model, ModelHandle, ModelInfo, ModelState};
pub use onnx::OnnxModel;
pub use pipeline::{
    EmbeddingSink, FrameMeta, FrameOutcome, FrameSource, Pipeline, PipelineCounters, PipelineError,
    PipelineStats,
};
pub use quantize::{dequantize, quantize, quantize_buffer, Requantizer};
pub use resample::{ImageResampler, ResampleError, Resampler};
pub use types::{Embedding, FrameRef, PixelFormat, QuantParams, QuantizedBuffer, ResizedBuffer, TensorShape};

/// Default location of the embedding model.
///
/// `$XDG_DATA_HOME/facestream/models`, falling back to
/// `~/.local/share/facestream/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facestream/models")
}
