//! Inference invoker: gate on the model state, then execute once.

use crate::model::{panic_message, InferenceError, LoadedModel, ModelHandle, ModelState};
use crate::pipeline::PipelineError;
use crate::types::{Embedding, QuantizedBuffer};
use std::panic::{self, AssertUnwindSafe};
use std::sync::TryLockError;

/// Resolve the loaded model, or the reason this frame must be skipped.
pub(crate) fn ready_model(handle: &ModelHandle) -> Result<&LoadedModel, PipelineError> {
    match handle.state() {
        ModelState::Loaded => handle
            .loaded()
            .ok_or(PipelineError::ModelNotReady(ModelState::Loading)),
        state @ (ModelState::Unloaded | ModelState::Loading) => {
            Err(PipelineError::ModelNotReady(state))
        }
        ModelState::LoadFailed => Err(PipelineError::ModelLoadFailed),
    }
}

/// Run the model synchronously on `input`.
///
/// Returns [`PipelineError::ModelNotReady`] while the model is unloaded or
/// loading and [`PipelineError::ModelLoadFailed`] after a failed load; both
/// are skips, not faults.
pub fn invoke(handle: &ModelHandle, input: &QuantizedBuffer) -> Result<Embedding, PipelineError> {
    let loaded = ready_model(handle)?;
    execute(loaded, input)
}

pub(crate) fn execute(
    loaded: &LoadedModel,
    input: &QuantizedBuffer,
) -> Result<Embedding, PipelineError> {
    let expected = loaded.info.input_shape.len();
    if input.len() != expected {
        return Err(InferenceError::ShapeMismatch {
            expected,
            actual: input.len(),
        }
        .into());
    }

    // A second caller never waits on the model; its frame is dropped instead.
    let mut model = match loaded.model.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::WouldBlock) => return Err(PipelineError::ModelBusy),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
    };

    let embedding = panic::catch_unwind(AssertUnwindSafe(|| model.execute(input)))
        .unwrap_or_else(|payload| Err(InferenceError::Panicked(panic_message(&*payload))))?;

    let want = loaded.info.embedding_len;
    if want != 0 && embedding.len() != want {
        return Err(InferenceError::BadOutput(format!(
            "expected {want}-dim embedding, got {}",
            embedding.len()
        ))
        .into());
    }

    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoadError, Model, ModelInfo};
    use crate::quantize::quantize_buffer;
    use crate::types::{QuantParams, ResizedBuffer, TensorShape};

    const SHAPE: TensorShape = TensorShape::new(2, 2, 3);

    enum Behaviour {
        Echo,
        Fail,
        Panic,
        WrongLen,
    }

    struct FakeModel {
        info: ModelInfo,
        behaviour: Behaviour,
    }

    impl Model for FakeModel {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn execute(&mut self, input: &QuantizedBuffer) -> Result<Embedding, InferenceError> {
            match self.behaviour {
                Behaviour::Echo => Ok(Embedding {
                    values: vec![input.as_slice()[0] as f32, 0.0],
                    model_version: None,
                }),
                Behaviour::Fail => Err(InferenceError::Runtime("delegate fault".into())),
                Behaviour::Panic => panic!("kernel blew up"),
                Behaviour::WrongLen => Ok(Embedding {
                    values: vec![0.0; 5],
                    model_version: None,
                }),
            }
        }
    }

    fn loaded(behaviour: Behaviour) -> ModelHandle {
        let handle = ModelHandle::new();
        handle
            .load_blocking(move || -> Result<Box<dyn Model>, LoadError> {
                Ok(Box::new(FakeModel {
                    info: ModelInfo {
                        name: "fake".into(),
                        version: None,
                        input_shape: SHAPE,
                        input_quant: QuantParams::default(),
                        embedding_len: 2,
                    },
                    behaviour,
                }))
            })
            .unwrap();
        handle
    }

    fn input(len: usize) -> QuantizedBuffer {
        let shape = TensorShape::new(len as u32, 1, 1);
        quantize_buffer(&ResizedBuffer::new(shape, vec![200; len]).unwrap())
    }

    #[test]
    fn test_unloaded_is_not_ready() {
        let handle = ModelHandle::new();
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotReady(ModelState::Unloaded)));
    }

    #[test]
    fn test_load_failed_is_skip() {
        let handle = ModelHandle::new();
        let _ = handle.load_blocking(|| Err(LoadError::InvalidModel("bad".into())));
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoadFailed));
        assert!(err.is_skip());
    }

    #[test]
    fn test_executes_when_loaded() {
        let handle = loaded(Behaviour::Echo);
        let emb = invoke(&handle, &input(12)).unwrap();
        assert_eq!(emb.values, vec![72.0, 0.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let handle = loaded(Behaviour::Echo);
        let err = invoke(&handle, &input(11)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Inference(InferenceError::ShapeMismatch { expected: 12, actual: 11 })
        ));
    }

    #[test]
    fn test_runtime_fault_is_contained() {
        let handle = loaded(Behaviour::Fail);
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(InferenceError::Runtime(_))));
        assert_eq!(handle.state(), ModelState::Loaded);
    }

    #[test]
    fn test_panic_is_contained() {
        let handle = loaded(Behaviour::Panic);
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(InferenceError::Panicked(ref m)) if m == "kernel blew up"));
        // The lock is not poisoned; the next call reaches the model again.
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(InferenceError::Panicked(_))));
    }

    #[test]
    fn test_wrong_embedding_length() {
        let handle = loaded(Behaviour::WrongLen);
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(InferenceError::BadOutput(_))));
    }

    #[test]
    fn test_busy_model_skips_instead_of_blocking() {
        let handle = loaded(Behaviour::Echo);
        let guard = handle.loaded().unwrap().model.lock().unwrap();
        let err = invoke(&handle, &input(12)).unwrap_err();
        assert!(matches!(err, PipelineError::ModelBusy));
        drop(guard);
        assert!(invoke(&handle, &input(12)).is_ok());
    }
}
