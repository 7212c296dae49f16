use facestream_core::pipeline::DEFAULT_LOG_EVERY;
use facestream_core::resample::parse_filter;
use facestream_hw::CameraPosition;
use image::imageops::FilterType;
use std::path::PathBuf;

const DEFAULT_MODEL_FILE: &str = "face_embedding_int8.onnx";

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which camera to stream from.
    pub camera_position: CameraPosition,
    /// V4L2 device for the user-facing camera (default: /dev/video0).
    pub front_device: String,
    /// V4L2 device for the world-facing camera (default: /dev/video2).
    pub back_device: String,
    /// Requested capture resolution; the driver may pick the nearest.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Path to the quantized embedding model.
    pub model_path: PathBuf,
    /// Quantization sidecar override; defaults to `<model>.quant.toml`.
    pub quant_path: Option<PathBuf>,
    /// Log per-frame successes and failures once every N occurrences.
    pub log_every: u64,
    /// Resampling filter for the 112×112 downscale.
    pub resize_filter: FilterType,
}

impl Config {
    /// Load configuration from `FACESTREAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_path = var("FACESTREAM_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| facestream_core::default_model_dir().join(DEFAULT_MODEL_FILE));

        let camera_position = match var("FACESTREAM_CAMERA_POSITION") {
            Some(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "using default camera position");
                CameraPosition::default()
            }),
            None => CameraPosition::default(),
        };

        let resize_filter = match var("FACESTREAM_RESIZE_FILTER") {
            Some(v) => parse_filter(&v).unwrap_or_else(|| {
                tracing::warn!(filter = %v, "unknown resize filter; using triangle");
                FilterType::Triangle
            }),
            None => FilterType::Triangle,
        };

        Self {
            camera_position,
            front_device: var("FACESTREAM_FRONT_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            back_device: var("FACESTREAM_BACK_DEVICE").unwrap_or_else(|| "/dev/video2".to_string()),
            capture_width: parse_or(&var, "FACESTREAM_CAPTURE_WIDTH", 640),
            capture_height: parse_or(&var, "FACESTREAM_CAPTURE_HEIGHT", 480),
            model_path,
            quant_path: var("FACESTREAM_QUANT_PATH").map(PathBuf::from),
            log_every: parse_or(&var, "FACESTREAM_LOG_EVERY", DEFAULT_LOG_EVERY),
            resize_filter,
        }
    }

    /// Device path for the configured camera position.
    pub fn camera_device(&self) -> &str {
        self.device_for(self.camera_position)
    }

    pub fn device_for(&self, position: CameraPosition) -> &str {
        match position {
            CameraPosition::Front => &self.front_device,
            CameraPosition::Back => &self.back_device,
        }
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
