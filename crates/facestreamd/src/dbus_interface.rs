use crate::engine::EngineHandle;
use zbus::interface;

pub const BUS_NAME: &str = "org.facestream.FaceStream1";
pub const OBJECT_PATH: &str = "/org/facestream/FaceStream1";

/// D-Bus interface for the facestream daemon.
///
/// Bus name: org.facestream.FaceStream1
/// Object path: /org/facestream/FaceStream1
pub struct FaceStreamService {
    engine: EngineHandle,
}

impl FaceStreamService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facestream.FaceStream1")]
impl FaceStreamService {
    /// Model state, load error (if any), camera and pipeline counters as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.engine.status())
            .map_err(|e| zbus::fdo::Error::Failed(format!("status encoding: {e}")))
    }

    /// Switch between the front and back cameras. Returns the position
    /// being switched to; Status() reports the camera actually in use.
    async fn toggle_camera(&self) -> String {
        self.engine.toggle_camera().to_string()
    }

    /// The most recent embedding as JSON, or `null` if none yet.
    async fn latest_embedding(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.engine.latest_embedding())
            .map_err(|e| zbus::fdo::Error::Failed(format!("embedding encoding: {e}")))
    }
}
