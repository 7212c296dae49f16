//! facestream-hw: camera capture for the embedding pipeline.
//!
//! Provides a V4L2 camera that delivers frames to the pipeline through the
//! `FrameSource` callback contract, and front/back camera selection.

pub mod camera;
pub mod frame;
pub mod position;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{BufferLayout, Frame};
pub use position::CameraPosition;
