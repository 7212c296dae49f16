use crate::config::Config;
use facestream_core::{
    Embedding, FrameMeta, ImageResampler, LoadError, Model, ModelHandle, ModelInfo, ModelState,
    OnnxModel, Pipeline, PipelineCounters, PipelineStats,
};
use facestream_hw::{Camera, CameraError, CameraPosition};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("model error: {0}")]
    Model(#[from] LoadError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
}

/// Most recent embedding handed to the result sink.
#[derive(Debug, Clone, Serialize)]
pub struct LatestEmbedding {
    pub sequence: u32,
    pub timestamp_ms: u128,
    pub model_version: Option<String>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub device: String,
    pub position: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Snapshot served by the D-Bus `Status` method.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub camera: CameraSummary,
    pub model_state: ModelState,
    pub model: Option<ModelInfo>,
    pub load_error: Option<String>,
    pub capturing: bool,
    pub capture_error: Option<String>,
    pub stats: PipelineStats,
}

struct Shared {
    model: ModelHandle,
    counters: Arc<PipelineCounters>,
    camera: Mutex<CameraSummary>,
    position: Mutex<CameraPosition>,
    /// Camera the capture thread should switch to at its next checkpoint.
    pending_switch: Mutex<Option<CameraPosition>>,
    switch: AtomicBool,
    latest: Mutex<Option<LatestEmbedding>>,
    capture_error: Mutex<Option<String>>,
    capturing: AtomicBool,
    stop: AtomicBool,
}

impl Shared {
    fn new(model: ModelHandle, counters: Arc<PipelineCounters>, camera: CameraSummary, position: CameraPosition) -> Self {
        Self {
            model,
            counters,
            camera: Mutex::new(camera),
            position: Mutex::new(position),
            pending_switch: Mutex::new(None),
            switch: AtomicBool::new(false),
            latest: Mutex::new(None),
            capture_error: Mutex::new(None),
            capturing: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        }
    }

    /// True when the current `drive` should return to the capture loop.
    fn interrupted(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.switch.load(Ordering::Acquire)
    }
}

/// Clone-safe handle to the capture engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn status(&self) -> StatusReport {
        let s = &self.shared;
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            camera: lock(&s.camera).clone(),
            model_state: s.model.state(),
            model: s.model.info().cloned(),
            load_error: s.model.load_failure().map(str::to_string),
            capturing: s.capturing.load(Ordering::Acquire),
            capture_error: lock(&s.capture_error).clone(),
            stats: s.counters.snapshot(),
        }
    }

    pub fn latest_embedding(&self) -> Option<LatestEmbedding> {
        lock(&self.shared.latest).clone()
    }

    /// Ask the capture thread to switch to the other camera.
    ///
    /// Returns the position being switched to. Requests made before the
    /// thread acts on the previous one toggle the pending target.
    pub fn toggle_camera(&self) -> CameraPosition {
        let s = &self.shared;
        let mut pending = lock(&s.pending_switch);
        let target = pending.unwrap_or(*lock(&s.position)).toggle();
        *pending = Some(target);
        s.switch.store(true, Ordering::Release);
        tracing::info!(to = %target, "camera switch requested");
        target
    }

    /// Ask the capture thread to stop after the frame in flight.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

/// Open the camera, start the model load, and spawn the capture thread.
///
/// The camera is opened synchronously so a missing device fails startup.
/// The model loads in the background; frames arriving before it is ready
/// are skipped.
pub fn spawn_engine(config: &Config) -> Result<(EngineHandle, JoinHandle<()>), EngineError> {
    let device = config.camera_device();
    let camera = Camera::open(device, config.capture_width, config.capture_height)?;
    tracing::info!(
        device,
        position = %config.camera_position,
        width = camera.width,
        height = camera.height,
        format = %camera.format,
        "camera opened"
    );

    let model = ModelHandle::new();
    let model_path = config.model_path_str();
    let quant_path = config.quant_path.clone();
    // The loader logs a failure itself; the handle keeps it for Status().
    let _ = model.begin_load(move || load_model(&model_path, quant_path))?;

    let pipeline = Pipeline::with_resampler(model.clone(), ImageResampler::new(config.resize_filter))
        .log_every(config.log_every);

    let shared = Arc::new(Shared::new(
        model,
        pipeline.counters(),
        summarize(&camera, config.camera_position),
        config.camera_position,
    ));

    let thread_shared = Arc::clone(&shared);
    let config = config.clone();
    let join = std::thread::Builder::new()
        .name("facestream-capture".into())
        .spawn(move || capture_loop(&thread_shared, &config, camera, pipeline))
        .map_err(EngineError::Spawn)?;

    Ok((EngineHandle { shared }, join))
}

/// Run the pipeline on the current camera, reopening on switch requests.
fn capture_loop(s: &Shared, config: &Config, mut camera: Camera, mut pipeline: Pipeline) {
    tracing::info!("capture thread started");
    let mut sink = |meta: FrameMeta, embedding: Embedding| {
        *lock(&s.latest) = Some(LatestEmbedding {
            sequence: meta.sequence,
            timestamp_ms: meta.timestamp.as_millis(),
            model_version: embedding.model_version,
            values: embedding.values,
        });
    };

    loop {
        if let Err(e) = pipeline.drive(&mut camera, &mut sink, || s.interrupted()) {
            tracing::error!(error = %e, "capture stopped");
            *lock(&s.capture_error) = Some(e.to_string());
            break;
        }
        if s.stop.load(Ordering::Acquire) || !s.switch.swap(false, Ordering::AcqRel) {
            break;
        }
        let target = lock(&s.pending_switch).take();
        if let Some(target) = target {
            switch_camera(s, config, &mut camera, target);
        }
    }

    s.capturing.store(false, Ordering::Release);
    tracing::info!(stats = ?pipeline.stats(), "capture thread exiting");
}

/// Open the camera at `target`, keeping the current one if that fails.
fn switch_camera(s: &Shared, config: &Config, camera: &mut Camera, target: CameraPosition) {
    let current = *lock(&s.position);
    if target == current {
        return;
    }
    let device = config.device_for(target);
    match Camera::open(device, config.capture_width, config.capture_height) {
        Ok(next) => {
            *camera = next;
            *lock(&s.position) = target;
            *lock(&s.camera) = summarize(camera, target);
            tracing::info!(from = %current, to = %target, device, "switched camera");
        }
        Err(e) => {
            tracing::warn!(error = %e, device, position = %current, "camera switch failed; keeping current camera");
        }
    }
}

fn load_model(model_path: &str, quant_path: Option<PathBuf>) -> Result<Box<dyn Model>, LoadError> {
    let model = match quant_path {
        Some(sidecar) => OnnxModel::load_with_sidecar(model_path, &sidecar)?,
        None => OnnxModel::load(model_path)?,
    };
    Ok(Box::new(model))
}

fn summarize(camera: &Camera, position: CameraPosition) -> CameraSummary {
    CameraSummary {
        device: camera.device_path.clone(),
        position: position.to_string(),
        width: camera.width,
        height: camera.height,
        format: camera.format.to_string(),
    }
}

/// Lock ignoring poison: the guarded values are plain snapshots.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_model_missing_file() {
        let err = load_model("/nonexistent/facestream/face.onnx", None).err().unwrap();
        assert!(matches!(err, LoadError::ModelNotFound(_)));
    }

    #[test]
    fn test_missing_model_surfaces_in_handle() {
        let model = ModelHandle::new();
        let join = model
            .begin_load(|| load_model("/nonexistent/facestream/face.onnx", None))
            .unwrap();
        join.join().unwrap();
        assert_eq!(model.state(), ModelState::LoadFailed);
        assert!(model.load_failure().unwrap().contains("face.onnx"));
    }

    fn shared() -> Arc<Shared> {
        let camera = CameraSummary {
            device: "/dev/video2".into(),
            position: "back".into(),
            width: 640,
            height: 480,
            format: "YUYV".into(),
        };
        Arc::new(Shared::new(
            ModelHandle::new(),
            Arc::new(PipelineCounters::default()),
            camera,
            CameraPosition::Back,
        ))
    }

    #[test]
    fn test_toggle_camera_requests_other_position() {
        let engine = EngineHandle { shared: shared() };
        assert!(!engine.shared.interrupted());

        assert_eq!(engine.toggle_camera(), CameraPosition::Front);
        assert!(engine.shared.interrupted());
        assert_eq!(*lock(&engine.shared.pending_switch), Some(CameraPosition::Front));
    }

    #[test]
    fn test_repeated_toggle_flips_pending_target() {
        let engine = EngineHandle { shared: shared() };
        engine.toggle_camera();
        assert_eq!(engine.toggle_camera(), CameraPosition::Back);
        assert_eq!(*lock(&engine.shared.pending_switch), Some(CameraPosition::Back));
    }

    #[test]
    fn test_shutdown_interrupts_capture() {
        let engine = EngineHandle { shared: shared() };
        engine.shutdown();
        assert!(engine.shared.interrupted());
        assert_eq!(engine.status().camera.position, "back");
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let m = Arc::new(Mutex::new(1));
        let m2 = Arc::clone(&m);
        let _ = std::thread::spawn(move || {
            let _guard = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(m.is_poisoned());
        assert_eq!(*lock(&m), 1);
    }

    #[test]
    fn test_latest_embedding_serializes() {
        let latest = LatestEmbedding {
            sequence: 3,
            timestamp_ms: 99,
            model_version: Some("mfn".into()),
            values: vec![0.25],
        };
        let json = serde_json::to_value(&latest).unwrap();
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["values"][0], 0.25);
    }
}
