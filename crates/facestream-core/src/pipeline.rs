//! Per-frame orchestration: resample → quantize → invoke → sink.
//!
//! Every frame runs to completion on the caller's thread. Nothing derived
//! from one frame survives into the next; the only state carried across
//! frames is the shared model handle, counters, and the last observed model
//! state (for one-time transition logging).

use crate::invoker;
use crate::model::{InferenceError, ModelHandle, ModelState};
use crate::resample::{ImageResampler, ResampleError, Resampler};
use crate::types::{Embedding, FrameRef};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default sampling interval for per-frame diagnostics.
pub const DEFAULT_LOG_EVERY: u64 = 30;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("resample failed: {0}")]
    Resample(#[from] ResampleError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("model not ready ({0})")]
    ModelNotReady(ModelState),
    #[error("model failed to load")]
    ModelLoadFailed,
    #[error("model busy with another frame")]
    ModelBusy,
}

impl PipelineError {
    /// True for expected skips that are never reported per frame.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            PipelineError::ModelNotReady(_) | PipelineError::ModelLoadFailed | PipelineError::ModelBusy
        )
    }
}

/// Identity of the frame an embedding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameMeta {
    pub sequence: u32,
    pub timestamp: Duration,
}

impl From<&FrameRef<'_>> for FrameMeta {
    fn from(frame: &FrameRef<'_>) -> Self {
        Self {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
        }
    }
}

/// Receives one embedding per successful frame. Ownership moves to the sink.
pub trait EmbeddingSink {
    fn accept(&mut self, frame: FrameMeta, embedding: Embedding);
}

impl<F> EmbeddingSink for F
where
    F: FnMut(FrameMeta, Embedding),
{
    fn accept(&mut self, frame: FrameMeta, embedding: Embedding) {
        self(frame, embedding)
    }
}

/// Delivers frames serially from a single producer.
///
/// Each `FrameRef` is valid only for the duration of the callback. Sources
/// that wait for hardware call `on_idle` whenever a wait times out without a
/// frame. Returning `ControlFlow::Break` from either callback stops the source.
pub trait FrameSource {
    type Error;

    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(&FrameRef<'_>) -> ControlFlow<()>,
        on_idle: &mut dyn FnMut() -> ControlFlow<()>,
    ) -> Result<(), Self::Error>;
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Embedded,
    Skipped,
    Failed,
}

/// Counters shared between the capture thread and status readers.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    frames: AtomicU64,
    embedded: AtomicU64,
    skipped: AtomicU64,
    resample_failures: AtomicU64,
    inference_failures: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames: self.frames.load(Ordering::Relaxed),
            embedded: self.embedded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            resample_failures: self.resample_failures.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub embedded: u64,
    pub skipped: u64,
    pub resample_failures: u64,
    pub inference_failures: u64,
}

/// Frame → embedding pipeline bound to one shared model.
///
/// Takes `&mut self` per frame, so a pipeline never runs two frames at once.
pub struct Pipeline<R = ImageResampler> {
    model: ModelHandle,
    resampler: R,
    counters: Arc<PipelineCounters>,
    observed: ModelState,
    log_every: u64,
}

impl Pipeline<ImageResampler> {
    pub fn new(model: ModelHandle) -> Self {
        Self::with_resampler(model, ImageResampler::default())
    }
}

impl<R: Resampler> Pipeline<R> {
    pub fn with_resampler(model: ModelHandle, resampler: R) -> Self {
        Self {
            model,
            resampler,
            counters: Arc::new(PipelineCounters::default()),
            observed: ModelState::Unloaded,
            log_every: DEFAULT_LOG_EVERY,
        }
    }

    /// Log successes and per-frame failures once every `n` occurrences.
    pub fn log_every(mut self, n: u64) -> Self {
        self.log_every = n.max(1);
        self
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Run one frame through resample, quantize and inference.
    ///
    /// The model state is checked before any work, so frames arriving while
    /// the model is unavailable cost nothing beyond the check.
    pub fn process_frame(&mut self, frame: &FrameRef<'_>) -> Result<Embedding, PipelineError> {
        let loaded = invoker::ready_model(&self.model)?;
        let resized = self.resampler.resize(frame, loaded.info.input_shape)?;
        let quantized = loaded.requantizer.apply(&resized);
        drop(resized);
        invoker::execute(loaded, &quantized)
    }

    /// Process one frame and contain every per-frame error.
    ///
    /// Successes go to `sink`. Skips are silent; resample and inference
    /// failures are counted and logged at the sampled rate.
    pub fn run_frame(&mut self, frame: &FrameRef<'_>, sink: &mut impl EmbeddingSink) -> FrameOutcome {
        self.observe_state();
        PipelineCounters::bump(&self.counters.frames);

        match self.process_frame(frame) {
            Ok(embedding) => {
                let n = PipelineCounters::bump(&self.counters.embedded);
                if self.sampled(n) {
                    tracing::info!(
                        seq = frame.sequence,
                        embedded = n,
                        dims = embedding.len(),
                        "embedding produced"
                    );
                }
                sink.accept(FrameMeta::from(frame), embedding);
                FrameOutcome::Embedded
            }
            Err(e) if e.is_skip() => {
                PipelineCounters::bump(&self.counters.skipped);
                FrameOutcome::Skipped
            }
            Err(PipelineError::Resample(e)) => {
                let n = PipelineCounters::bump(&self.counters.resample_failures);
                if self.sampled(n) {
                    tracing::warn!(
                        seq = frame.sequence,
                        format = %frame.format,
                        failures = n,
                        error = %e,
                        "frame dropped: resample failed"
                    );
                }
                FrameOutcome::Failed
            }
            Err(e) => {
                let n = PipelineCounters::bump(&self.counters.inference_failures);
                if self.sampled(n) {
                    tracing::warn!(
                        seq = frame.sequence,
                        failures = n,
                        error = %e,
                        "frame dropped: inference failed"
                    );
                }
                FrameOutcome::Failed
            }
        }
    }

    /// Pull frames from `source` until it ends or `stop` returns true.
    ///
    /// `stop` is polled after every frame and on every idle timeout, so a
    /// stalled source still honours it.
    pub fn drive<S, K, F>(&mut self, source: &mut S, sink: &mut K, stop: F) -> Result<(), S::Error>
    where
        S: FrameSource,
        K: EmbeddingSink,
        F: Fn() -> bool,
    {
        let check = || {
            if stop() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        source.run(
            &mut |frame| {
                self.run_frame(frame, sink);
                check()
            },
            &mut || check(),
        )
    }

    fn sampled(&self, n: u64) -> bool {
        n % self.log_every == 1 || self.log_every == 1
    }

    fn observe_state(&mut self) {
        let state = self.model.state();
        if state == self.observed {
            return;
        }
        match state {
            ModelState::LoadFailed => tracing::warn!(
                from = %self.observed,
                "pipeline idle: model failed to load"
            ),
            _ => tracing::info!(from = %self.observed, to = %state, "pipeline observed model state"),
        }
        self.observed = state;
    }
}
