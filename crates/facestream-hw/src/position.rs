use std::fmt;
use std::str::FromStr;

/// Which way the camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraPosition {
    Front,
    #[default]
    Back,
}

impl CameraPosition {
    /// The opposite camera.
    pub fn toggle(self) -> Self {
        match self {
            CameraPosition::Front => CameraPosition::Back,
            CameraPosition::Back => CameraPosition::Front,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CameraPosition::Front => "front",
            CameraPosition::Back => "back",
        }
    }
}

impl fmt::Display for CameraPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown camera position {0:?} (expected front or back)")]
pub struct ParsePositionError(String);

impl FromStr for CameraPosition {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" | "user" | "selfie" => Ok(CameraPosition::Front),
            "back" | "rear" | "environment" => Ok(CameraPosition::Back),
            _ => Err(ParsePositionError(s.to_string())),
        }
    }
}
