use facestream_core::{
    Embedding, FrameMeta, FrameOutcome, FrameRef, FrameSource, InferenceError, LoadError, Model,
    ModelHandle, ModelInfo, ModelState, Pipeline, PixelFormat, QuantParams, QuantizedBuffer,
    TensorShape,
};
use std::ops::ControlFlow;
use std::sync::mpsc;
use std::time::Duration;

const SHAPE: TensorShape = TensorShape::new(4, 4, 3);

/// Fails on inputs whose first sample is the marker value; otherwise returns
/// the mean of the quantized input.
struct MarkerModel {
    info: ModelInfo,
    fail_marker: i8,
}

impl Model for MarkerModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn execute(&mut self, input: &QuantizedBuffer) -> Result<Embedding, InferenceError> {
        let samples = input.as_slice();
        if samples[0] == self.fail_marker {
            return Err(InferenceError::Runtime("injected fault".into()));
        }
        let mean = samples.iter().map(|&q| q as f32).sum::<f32>() / samples.len() as f32;
        Ok(Embedding {
            values: vec![mean, 1.0],
            model_version: Some("marker".into()),
        })
    }
}

fn marker_model() -> Result<Box<dyn Model>, LoadError> {
    Ok(Box::new(MarkerModel {
        info: ModelInfo {
            name: "marker".into(),
            version: Some("marker".into()),
            input_shape: SHAPE,
            input_quant: QuantParams::default(),
            embedding_len: 2,
        },
        // pixel value 1 → -127
        fail_marker: -127,
    }))
}

struct OwnedFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u32,
}

impl OwnedFrame {
    fn rgb(value: u8, sequence: u32) -> Self {
        Self {
            data: vec![value; 8 * 8 * 3],
            width: 8,
            height: 8,
            format: PixelFormat::Rgb24,
            sequence,
        }
    }

    fn mjpeg(sequence: u32) -> Self {
        Self {
            data: vec![0xFF; 512],
            width: 8,
            height: 8,
            format: PixelFormat::Unsupported(*b"MJPG"),
            sequence,
        }
    }

    fn view(&self) -> FrameRef<'_> {
        FrameRef {
            data: &self.data,
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp: Duration::from_millis(self.sequence as u64 * 33),
            sequence: self.sequence,
        }
    }
}

/// Frame source replaying a fixed list of frames.
struct ScriptedSource {
    frames: Vec<OwnedFrame>,
}

impl FrameSource for ScriptedSource {
    type Error = std::convert::Infallible;

    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(&FrameRef<'_>) -> ControlFlow<()>,
        _on_idle: &mut dyn FnMut() -> ControlFlow<()>,
    ) -> Result<(), Self::Error> {
        for frame in &self.frames {
            if on_frame(&frame.view()).is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// Frame source whose device never delivers: every wait times out.
struct StalledSource {
    idle_calls: usize,
}

impl FrameSource for StalledSource {
    type Error = std::convert::Infallible;

    fn run(
        &mut self,
        _on_frame: &mut dyn FnMut(&FrameRef<'_>) -> ControlFlow<()>,
        on_idle: &mut dyn FnMut() -> ControlFlow<()>,
    ) -> Result<(), Self::Error> {
        loop {
            self.idle_calls += 1;
            assert!(self.idle_calls < 1_000, "stalled source was never stopped");
            if on_idle().is_break() {
                return Ok(());
            }
        }
    }
}

fn loaded_pipeline() -> Pipeline {
    let handle = ModelHandle::new();
    handle.load_blocking(marker_model).unwrap();
    Pipeline::new(handle)
}

#[test]
fn test_frame_after_resample_failure_succeeds() {
    let mut pipeline = loaded_pipeline();
    let mut embeddings = Vec::new();
    let mut sink = |meta: FrameMeta, e: Embedding| embeddings.push((meta.sequence, e));

    let bad = OwnedFrame::mjpeg(0);
    let good = OwnedFrame::rgb(200, 1);

    assert_eq!(pipeline.run_frame(&bad.view(), &mut sink), FrameOutcome::Failed);
    assert_eq!(pipeline.run_frame(&good.view(), &mut sink), FrameOutcome::Embedded);

    assert_eq!(embeddings.len(), 1);
    assert_eq!(embeddings[0].0, 1);
    assert_eq!(embeddings[0].1.values[0], 72.0);

    let stats = pipeline.stats();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.resample_failures, 1);
    assert_eq!(stats.embedded, 1);
    assert_eq!(pipeline.model().state(), ModelState::Loaded);
}

#[test]
fn test_frame_after_inference_failure_succeeds() {
    let mut pipeline = loaded_pipeline();
    let mut embeddings = Vec::new();
    let mut sink = |_: FrameMeta, e: Embedding| embeddings.push(e);

    let faulty = OwnedFrame::rgb(1, 0);
    let good = OwnedFrame::rgb(128, 1);

    assert_eq!(pipeline.run_frame(&faulty.view(), &mut sink), FrameOutcome::Failed);
    assert_eq!(pipeline.run_frame(&good.view(), &mut sink), FrameOutcome::Embedded);
    assert_eq!(pipeline.run_frame(&faulty.view(), &mut sink), FrameOutcome::Failed);
    assert_eq!(pipeline.run_frame(&good.view(), &mut sink), FrameOutcome::Embedded);

    // The failed frame leaves nothing behind: both good frames see a clean buffer.
    assert_eq!(embeddings.len(), 2);
    assert!(embeddings.iter().all(|e| e.values[0] == 0.0));
    assert_eq!(pipeline.stats().inference_failures, 2);
    assert_eq!(pipeline.model().state(), ModelState::Loaded);
}

#[test]
fn test_process_frame_reports_inference_failure() {
    let mut pipeline = loaded_pipeline();
    let err = pipeline.process_frame(&OwnedFrame::rgb(1, 0).view()).unwrap_err();
    assert!(!err.is_skip());
    assert!(err.to_string().contains("injected fault"));
}

#[test]
fn test_no_output_while_unloaded() {
    let mut pipeline = Pipeline::new(ModelHandle::new());
    let mut count = 0usize;
    let mut sink = |_: FrameMeta, _: Embedding| count += 1;

    for seq in 0..500 {
        let outcome = pipeline.run_frame(&OwnedFrame::rgb(1, seq).view(), &mut sink);
        assert_eq!(outcome, FrameOutcome::Skipped);
    }

    assert_eq!(count, 0);
    let stats = pipeline.stats();
    assert_eq!(stats.skipped, 500);
    assert_eq!(stats.inference_failures, 0);
    assert_eq!(stats.resample_failures, 0);
}

#[test]
fn test_mid_stream_load_transition() {
    let handle = ModelHandle::new();
    let mut pipeline = Pipeline::new(handle.clone());
    let mut embedded = Vec::new();
    let mut sink = |meta: FrameMeta, _: Embedding| embedded.push(meta.sequence);

    // Unloaded
    assert_eq!(
        pipeline.run_frame(&OwnedFrame::rgb(200, 0).view(), &mut sink),
        FrameOutcome::Skipped
    );

    // Loading: the loader blocks until released.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let loader = handle
        .begin_load(move || {
            release_rx.recv().ok();
            marker_model()
        })
        .unwrap();
    assert_eq!(handle.state(), ModelState::Loading);

    for seq in 1..50 {
        assert_eq!(
            pipeline.run_frame(&OwnedFrame::rgb(200, seq).view(), &mut sink),
            FrameOutcome::Skipped
        );
    }

    release_tx.send(()).unwrap();
    loader.join().unwrap();
    assert_eq!(handle.state(), ModelState::Loaded);

    // First frame after Loaded is processed normally.
    assert_eq!(
        pipeline.run_frame(&OwnedFrame::rgb(200, 50).view(), &mut sink),
        FrameOutcome::Embedded
    );

    assert_eq!(embedded, vec![50]);
    let stats = pipeline.stats();
    assert_eq!(stats.skipped, 50);
    assert_eq!(stats.inference_failures, 0);
}

#[test]
fn test_load_failed_is_permanent_no_op() {
    let handle = ModelHandle::new();
    let _ = handle.load_blocking(|| Err(LoadError::ModelNotFound("face.onnx".into())));
    let mut pipeline = Pipeline::new(handle);
    let mut count = 0usize;
    let mut sink = |_: FrameMeta, _: Embedding| count += 1;

    for seq in 0..100 {
        assert_eq!(
            pipeline.run_frame(&OwnedFrame::rgb(90, seq).view(), &mut sink),
            FrameOutcome::Skipped
        );
    }

    assert_eq!(count, 0);
    assert_eq!(pipeline.stats().inference_failures, 0);
    assert_eq!(pipeline.model().state(), ModelState::LoadFailed);
    assert!(pipeline.model().load_failure().unwrap().contains("face.onnx"));
}

#[test]
fn test_drive_stops_on_request() {
    let mut pipeline = loaded_pipeline();
    let mut source = ScriptedSource {
        frames: vec![
            OwnedFrame::rgb(10, 0),
            OwnedFrame::mjpeg(1),
            OwnedFrame::rgb(1, 2),
            OwnedFrame::rgb(250, 3),
            OwnedFrame::rgb(250, 4),
        ],
    };

    let counters = pipeline.counters();
    let mut seen = Vec::new();
    let mut sink = |meta: FrameMeta, _: Embedding| seen.push(meta.sequence);

    pipeline
        .drive(&mut source, &mut sink, || counters.snapshot().frames >= 4)
        .unwrap();

    assert_eq!(seen, vec![0, 3]);
    let stats = pipeline.stats();
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.resample_failures, 1);
    assert_eq!(stats.inference_failures, 1);
}

#[test]
fn test_non_default_quant_params_reach_the_model() {
    let handle = ModelHandle::new();
    handle
        .load_blocking(|| -> Result<Box<dyn Model>, LoadError> {
            Ok(Box::new(MarkerModel {
                info: ModelInfo {
                    name: "sym".into(),
                    version: None,
                    input_shape: SHAPE,
                    input_quant: QuantParams { scale: 2.0, zero_point: 0 },
                    embedding_len: 2,
                },
                fail_marker: i8::MIN,
            }))
        })
        .unwrap();

    let mut pipeline = Pipeline::new(handle);
    let emb = pipeline.process_frame(&OwnedFrame::rgb(200, 0).view()).unwrap();
    assert_eq!(emb.values[0], 100.0);
}

#[test]
fn test_drive_stops_while_source_is_stalled() {
    let mut pipeline = loaded_pipeline();
    let mut source = StalledSource { idle_calls: 0 };
    let stop = std::cell::Cell::new(0u32);
    let mut delivered = 0usize;
    let mut sink = |_: FrameMeta, _: Embedding| delivered += 1;

    pipeline
        .drive(&mut source, &mut sink, || {
            stop.set(stop.get() + 1);
            stop.get() >= 3
        })
        .unwrap();

    assert_eq!(source.idle_calls, 3);
    assert_eq!(delivered, 0);
    assert_eq!(pipeline.stats().frames, 0);
}
