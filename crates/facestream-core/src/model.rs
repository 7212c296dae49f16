//! Model capability and its process-wide load lifecycle.
//!
//! A [`ModelHandle`] is the single source of truth for whether the network
//! can be executed. It starts `Unloaded`, moves to `Loading` exactly once,
//! and ends in `Loaded` or `LoadFailed`. The loaded model is published before
//! the state flips to `Loaded` (release store / acquire load), so any reader
//! that observes `Loaded` also observes the model and its metadata.

use crate::quantize::{QuantError, Requantizer};
use crate::types::{Embedding, QuantParams, QuantizedBuffer, TensorShape};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("quantization metadata: {0}")]
    Quant(#[from] QuantError),
    #[error("quantization sidecar {path}: {reason}")]
    Sidecar { path: String, reason: String },
    #[error("model load already started")]
    AlreadyStarted,
    #[error("model loader panicked: {0}")]
    LoaderPanicked(String),
    #[error("failed to spawn loader thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("input has {actual} samples, model expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("model output: {0}")]
    BadOutput(String),
    #[error("model runtime fault: {0}")]
    Runtime(String),
    #[error("model panicked: {0}")]
    Panicked(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Load lifecycle of the shared model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModelState {
    Unloaded = 0,
    Loading = 1,
    Loaded = 2,
    LoadFailed = 3,
}

impl ModelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ModelState::Unloaded,
            1 => ModelState::Loading,
            2 => ModelState::Loaded,
            _ => ModelState::LoadFailed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Loaded => "loaded",
            ModelState::LoadFailed => "load_failed",
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata a model declares once loaded.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: Option<String>,
    /// Interleaved RGB input the resample stage must produce.
    pub input_shape: TensorShape,
    /// Parameters the u8 → i8 requantization must honour.
    pub input_quant: QuantParams,
    /// Embedding length, or 0 when the model leaves it dynamic.
    pub embedding_len: usize,
}

/// A loaded quantized network.
///
/// `execute` takes `&mut self`: implementations are not required to be
/// reentrant, and the handle never runs two executions at once.
pub trait Model: Send {
    fn info(&self) -> &ModelInfo;

    fn execute(&mut self, input: &QuantizedBuffer) -> Result<Embedding, InferenceError>;
}

/// Loaded model plus the metadata derived from it at load time.
pub(crate) struct LoadedModel {
    pub(crate) info: ModelInfo,
    pub(crate) requantizer: Requantizer,
    pub(crate) model: Mutex<Box<dyn Model>>,
}

struct Shared {
    state: AtomicU8,
    loaded: OnceLock<LoadedModel>,
    failure: OnceLock<String>,
}

/// Clone-safe, process-wide handle to the model.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<Shared>,
}

impl Default for ModelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl ModelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                state: AtomicU8::new(ModelState::Unloaded as u8),
                loaded: OnceLock::new(),
                failure: OnceLock::new(),
            }),
        }
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Metadata of the loaded model; `None` until the state is `Loaded`.
    pub fn info(&self) -> Option<&ModelInfo> {
        self.loaded().map(|l| &l.info)
    }

    /// Reason the load failed; `None` unless the state is `LoadFailed`.
    pub fn load_failure(&self) -> Option<&str> {
        if self.state() != ModelState::LoadFailed {
            return None;
        }
        self.inner.failure.get().map(String::as_str)
    }

    pub(crate) fn loaded(&self) -> Option<&LoadedModel> {
        if self.state() != ModelState::Loaded {
            return None;
        }
        self.inner.loaded.get()
    }

    /// Start loading on a dedicated thread. Only the first call does anything;
    /// later calls fail with [`LoadError::AlreadyStarted`].
    pub fn begin_load<F>(&self, loader: F) -> Result<JoinHandle<()>, LoadError>
    where
        F: FnOnce() -> Result<Box<dyn Model>, LoadError> + Send + 'static,
    {
        self.enter_loading()?;

        let handle = self.clone();
        let spawned = std::thread::Builder::new()
            .name("facestream-loader".into())
            .spawn(move || {
                let _ = handle.finish(run_loader(loader));
            });

        match spawned {
            Ok(join) => Ok(join),
            Err(e) => {
                self.fail(format!("failed to spawn loader thread: {e}"));
                Err(LoadError::Spawn(e))
            }
        }
    }

    /// Load on the calling thread. Used by tools that have nothing to do
    /// until the model is ready.
    pub fn load_blocking<F>(&self, loader: F) -> Result<(), LoadError>
    where
        F: FnOnce() -> Result<Box<dyn Model>, LoadError>,
    {
        self.enter_loading()?;
        self.finish(run_loader(loader))
    }

    fn enter_loading(&self) -> Result<(), LoadError> {
        self.inner
            .state
            .compare_exchange(
                ModelState::Unloaded as u8,
                ModelState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| {
                tracing::info!("model loading");
            })
            .map_err(|_| LoadError::AlreadyStarted)
    }

    fn finish(&self, result: Result<Box<dyn Model>, LoadError>) -> Result<(), LoadError> {
        let published = result.and_then(|model| self.publish(model));
        if let Err(e) = &published {
            self.fail(e.to_string());
        }
        published
    }

    fn publish(&self, model: Box<dyn Model>) -> Result<(), LoadError> {
        let info = model.info().clone();
        if info.input_shape.channels != 3 || info.input_shape.is_empty() {
            return Err(LoadError::InvalidModel(format!(
                "input shape {} is not interleaved RGB",
                info.input_shape
            )));
        }
        let requantizer = Requantizer::from_params(info.input_quant)?;

        tracing::info!(
            model = %info.name,
            version = ?info.version,
            input = %info.input_shape,
            scale = info.input_quant.scale,
            zero_point = info.input_quant.zero_point,
            embedding_len = info.embedding_len,
            "model loaded"
        );

        let loaded = LoadedModel {
            info,
            requantizer,
            model: Mutex::new(model),
        };
        if self.inner.loaded.set(loaded).is_err() {
            return Err(LoadError::AlreadyStarted);
        }
        self.inner
            .state
            .store(ModelState::Loaded as u8, Ordering::Release);
        Ok(())
    }

    fn fail(&self, reason: String) {
        tracing::error!(error = %reason, "model load failed; face embeddings unavailable");
        let _ = self.inner.failure.set(reason);
        self.inner
            .state
            .store(ModelState::LoadFailed as u8, Ordering::Release);
    }
}

fn run_loader<F>(loader: F) -> Result<Box<dyn Model>, LoadError>
where
    F: FnOnce() -> Result<Box<dyn Model>, LoadError>,
{
    panic::catch_unwind(AssertUnwindSafe(loader))
        .unwrap_or_else(|payload| Err(LoadError::LoaderPanicked(panic_message(&*payload))))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
