//! Quantized face-embedding network via ONNX Runtime.
//!
//! Accepts models with a single 3-channel image input in NHWC or NCHW
//! layout, stored as int8 (fed the requantized buffer directly) or float32
//! (fed the dequantized real values). Quantization parameters come from an
//! optional TOML sidecar next to the model file:
//!
//! ```toml
//! version = "mobilefacenet_int8"
//!
//! [input]
//! scale = 1.0
//! zero_point = -128
//!
//! [output]
//! scale = 0.0078125
//! zero_point = 0
//! ```

use crate::model::{InferenceError, LoadError, Model, ModelInfo};
use crate::types::{l2_normalize, Embedding, QuantParams, QuantizedBuffer, TensorShape};
use ndarray::{Array4, ArrayView4};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{TensorRef, ValueType};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Fallback spatial size when the model leaves height/width dynamic.
const DEFAULT_INPUT_SIZE: u32 = 112;
const SIDECAR_EXTENSION: &str = "quant.toml";

/// Memory layout of the model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nhwc,
    Nchw,
}

/// Element type of an image input or embedding output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Int8,
    Float32,
}

/// Quantization metadata shipped alongside a model file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantSidecar {
    pub version: Option<String>,
    pub input: Option<QuantParams>,
    pub output: Option<QuantParams>,
}

impl QuantSidecar {
    pub fn parse(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    /// Read the sidecar at `path`. A missing file yields `Ok(None)`.
    pub fn read(path: &Path) -> Result<Option<Self>, LoadError> {
        let src = match std::fs::read_to_string(path) {
            Ok(src) => src,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LoadError::Sidecar {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };
        Self::parse(&src).map(Some).map_err(|e| LoadError::Sidecar {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// `face.onnx` → `face.quant.toml`.
pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension(SIDECAR_EXTENSION)
}

/// ONNX-backed [`Model`].
pub struct OnnxModel {
    session: Session,
    info: ModelInfo,
    layout: Layout,
    input_precision: Precision,
    output_precision: Precision,
    output_quant: QuantParams,
}

impl OnnxModel {
    /// Load a model and its sidecar (`<model>.quant.toml`, if present).
    pub fn load(model_path: &str) -> Result<Self, LoadError> {
        let sidecar = sidecar_path(Path::new(model_path));
        Self::load_with_sidecar(model_path, &sidecar)
    }

    pub fn load_with_sidecar(model_path: &str, sidecar_path: &Path) -> Result<Self, LoadError> {
        let path = Path::new(model_path);
        if !path.exists() {
            return Err(LoadError::ModelNotFound(model_path.to_string()));
        }

        let sidecar = match QuantSidecar::read(sidecar_path)? {
            Some(s) => s,
            None => {
                tracing::warn!(
                    sidecar = %sidecar_path.display(),
                    "no quantization sidecar; assuming input scale=1.0 zero_point=-128"
                );
                QuantSidecar::default()
            }
        };

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "opened ONNX session"
        );

        if session.inputs().len() != 1 {
            return Err(LoadError::InvalidModel(format!(
                "expected exactly one image input, got {}",
                session.inputs().len()
            )));
        }
        let (input_ty, input_dims) = tensor_type(session.inputs()[0].dtype())?;
        let input_precision = precision(input_ty)?;
        let (layout, input_shape) = parse_input_layout(&input_dims)?;

        let first_output = session
            .outputs()
            .first()
            .ok_or_else(|| LoadError::InvalidModel("model has no outputs".into()))?;
        let (output_ty, output_dims) = tensor_type(first_output.dtype())?;
        let output_precision = precision(output_ty)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.to_string());

        let info = ModelInfo {
            version: sidecar.version.clone().or_else(|| Some(name.clone())),
            name,
            input_shape,
            input_quant: sidecar.input.unwrap_or_default(),
            embedding_len: embedding_len(&output_dims),
        };

        tracing::debug!(?layout, ?input_precision, ?output_precision, "model tensor layout");

        Ok(Self {
            session,
            info,
            layout,
            input_precision,
            output_precision,
            output_quant: sidecar.output.unwrap_or(QuantParams {
                scale: 1.0,
                zero_point: 0,
            }),
        })
    }

    /// Lay out the interleaved buffer the way the model expects.
    fn arrange<T: Clone>(&self, nhwc: ArrayView4<'_, T>) -> Array4<T> {
        match self.layout {
            Layout::Nhwc => nhwc.to_owned(),
            Layout::Nchw => nhwc.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned(),
        }
    }
}

impl Model for OnnxModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn execute(&mut self, input: &QuantizedBuffer) -> Result<Embedding, InferenceError> {
        let shape = self.info.input_shape;
        let dims = (
            1,
            shape.height as usize,
            shape.width as usize,
            shape.channels as usize,
        );
        let nhwc = ArrayView4::from_shape(dims, input.as_slice()).map_err(|_| {
            InferenceError::ShapeMismatch {
                expected: shape.len(),
                actual: input.len(),
            }
        })?;

        let outputs = match self.input_precision {
            Precision::Int8 => {
                let tensor = self.arrange(nhwc);
                self.session
                    .run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?
            }
            Precision::Float32 => {
                let params = self.info.input_quant;
                let real = nhwc.mapv(|q| params.dequantize(q));
                let tensor = self.arrange(real.view());
                self.session
                    .run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?
            }
        };

        let mut values: Vec<f32> = match self.output_precision {
            Precision::Float32 => {
                let (_, data) = outputs[0]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| InferenceError::BadOutput(format!("embedding extraction: {e}")))?;
                data.to_vec()
            }
            Precision::Int8 => {
                let (_, data) = outputs[0]
                    .try_extract_tensor::<i8>()
                    .map_err(|e| InferenceError::BadOutput(format!("embedding extraction: {e}")))?;
                data.iter().map(|&q| self.output_quant.dequantize(q)).collect()
            }
        };

        if values.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::BadOutput("non-finite embedding value".into()));
        }
        l2_normalize(&mut values);

        Ok(Embedding {
            values,
            model_version: self.info.version.clone(),
        })
    }
}

fn tensor_type(value_type: &ValueType) -> Result<(TensorElementType, Vec<i64>), LoadError> {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => Ok((*ty, shape.iter().copied().collect())),
        other => Err(LoadError::InvalidModel(format!(
            "expected a tensor, got {other:?}"
        ))),
    }
}

fn precision(ty: TensorElementType) -> Result<Precision, LoadError> {
    match ty {
        TensorElementType::Int8 => Ok(Precision::Int8),
        TensorElementType::Float32 => Ok(Precision::Float32),
        other => Err(LoadError::InvalidModel(format!(
            "unsupported tensor element type {other:?} (need int8 or float32)"
        ))),
    }
}

/// Work out layout and HWC shape from a rank-4 image input.
///
/// Channels-last wins when both axis 1 and axis 3 are 3 (a 3×W×3 image is
/// far less likely than a 3-channel NHWC tensor).
pub fn parse_input_layout(dims: &[i64]) -> Result<(Layout, TensorShape), LoadError> {
    if dims.len() != 4 {
        return Err(LoadError::InvalidModel(format!(
            "expected rank-4 image input, got shape {dims:?}"
        )));
    }
    if dims[0] > 1 {
        return Err(LoadError::InvalidModel(format!(
            "batch dimension must be 1 or dynamic, got {}",
            dims[0]
        )));
    }

    let (layout, h, w) = if dims[3] == 3 {
        (Layout::Nhwc, dims[1], dims[2])
    } else if dims[1] == 3 {
        (Layout::Nchw, dims[2], dims[3])
    } else {
        return Err(LoadError::InvalidModel(format!(
            "input {dims:?} has no 3-channel axis"
        )));
    };

    let side = |d: i64| if d > 0 { d as u32 } else { DEFAULT_INPUT_SIZE };
    Ok((layout, TensorShape::new(side(w), side(h), 3)))
}

/// Number of embedding values, or 0 if any non-batch dimension is dynamic.
pub fn embedding_len(dims: &[i64]) -> usize {
    let rest = match dims.split_first() {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => dims,
    };
    if rest.iter().any(|&d| d <= 0) {
        return 0;
    }
    rest.iter().map(|&d| d as usize).product()
}
