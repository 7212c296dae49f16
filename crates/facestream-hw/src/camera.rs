//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, BufferLayout, Frame};
use facestream_core::{FrameRef, FrameSource, PixelFormat};
use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Formats to request, in order of preference.
const PREFERRED_FOURCCS: [&[u8; 4]; 4] = [b"YUYV", b"NV12", b"RGB3", b"GREY"];

const STREAM_BUFFERS: u32 = 4;

/// How long a dequeue waits before the stream reports itself idle.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive stream failures tolerated before capture gives up.
pub const MAX_STREAM_RETRIES: u32 = 5;

/// Consecutive idle timeouts before a one-shot capture gives up.
pub const CAPTURE_IDLE_LIMIT: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const TIMEOUT_LOG_EVERY: u64 = 10;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pub format: PixelFormat,
    /// Bytes per row as reported by the driver.
    stride: usize,
}

impl Camera {
    /// Open a V4L2 camera and negotiate a format the pipeline can convert.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.width = width;
        fmt.height = height;

        // Drivers answer set_format with the closest thing they support, so
        // walk the preference list until one comes back convertible.
        let mut negotiated = None;
        for fourcc in PREFERRED_FOURCCS {
            fmt.fourcc = FourCC::new(fourcc);
            let got = device.set_format(&fmt).map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            })?;
            let format = frame::pixel_format_from_fourcc(got.fourcc.repr);
            if !matches!(format, PixelFormat::Unsupported(_)) {
                negotiated = Some((got, format));
                break;
            }
            tracing::debug!(requested = ?fourcc, got = ?got.fourcc, "format not convertible");
        }

        let (negotiated, format) = negotiated.ok_or_else(|| {
            CameraError::FormatNegotiationFailed(
                "driver offers none of YUYV, NV12, RGB3, GREY".to_string(),
            )
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            stride = negotiated.stride,
            %format,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            format,
            stride: negotiated.stride as usize,
        })
    }

    /// Capture a single frame into an owned buffer.
    ///
    /// Gives up after [`CAPTURE_IDLE_LIMIT`] consecutive timeouts.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut captured = None;
        let mut idle = 0u32;
        self.stream(
            &mut |view| {
                captured = Some(Frame::from_view(view));
                ControlFlow::Break(())
            },
            &mut || {
                idle += 1;
                if idle >= CAPTURE_IDLE_LIMIT {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )?;
        captured.ok_or_else(|| {
            CameraError::CaptureFailed(format!(
                "no frame within {:?}",
                DEQUEUE_TIMEOUT * CAPTURE_IDLE_LIMIT
            ))
        })
    }

    /// Stream frames into `on_frame` until a callback breaks or capture fails.
    ///
    /// Each frame is borrowed from the mmap buffer (or a reused scratch
    /// buffer when rows are padded) and is only valid during the callback.
    /// A dequeue that times out calls `on_idle` and restarts the stream.
    /// Dequeue errors restart it too, up to [`MAX_STREAM_RETRIES`] in a row.
    pub fn stream(
        &self,
        on_frame: &mut dyn FnMut(&FrameRef<'_>) -> ControlFlow<()>,
        on_idle: &mut dyn FnMut() -> ControlFlow<()>,
    ) -> Result<(), CameraError> {
        let layout = BufferLayout {
            format: self.format,
            width: self.width,
            height: self.height,
            stride: self.stride,
        };
        let padded = layout.is_padded();
        let mut scratch = Vec::new();
        let mut retry = RetryBudget::new(MAX_STREAM_RETRIES);
        let mut timeouts = 0u64;
        let start = Instant::now();

        loop {
            let mut stream = match self.open_stream() {
                Ok(stream) => stream,
                Err(e) => {
                    retry.record(&e)?;
                    if on_idle().is_break() {
                        return Ok(());
                    }
                    std::thread::sleep(RETRY_BACKOFF);
                    continue;
                }
            };

            // The stream is restarted after any failed dequeue: v4l re-queues
            // the previous buffer on the next call, which is only valid after
            // a successful dequeue.
            loop {
                let (buf, meta) = match stream.next() {
                    Ok(next) => next,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        timeouts += 1;
                        if timeouts % TIMEOUT_LOG_EVERY == 1 {
                            tracing::warn!(
                                device = %self.device_path,
                                timeouts,
                                timeout = ?DEQUEUE_TIMEOUT,
                                "no frame from camera; restarting stream"
                            );
                        }
                        if on_idle().is_break() {
                            return Ok(());
                        }
                        break;
                    }
                    Err(e) => {
                        retry.record(&CameraError::CaptureFailed(format!(
                            "failed to dequeue buffer: {e}"
                        )))?;
                        if on_idle().is_break() {
                            return Ok(());
                        }
                        std::thread::sleep(RETRY_BACKOFF);
                        break;
                    }
                };
                retry.reset();
                timeouts = 0;

                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };

                let data: &[u8] = if padded {
                    // A failed repack leaves scratch empty, which the
                    // resampler rejects as too short.
                    if !layout.repack(&buf[..used], &mut scratch) {
                        tracing::debug!(seq = meta.sequence, used, "short padded buffer");
                    }
                    &scratch
                } else {
                    &buf[..used]
                };

                let view = FrameRef {
                    data,
                    width: self.width,
                    height: self.height,
                    format: self.format,
                    timestamp: start.elapsed(),
                    sequence: meta.sequence,
                };

                if on_frame(&view).is_break() {
                    return Ok(());
                }
            }
        }
    }

    fn open_stream(&self) -> Result<MmapStream<'_>, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        Ok(stream)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    type Error = CameraError;

    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(&FrameRef<'_>) -> ControlFlow<()>,
        on_idle: &mut dyn FnMut() -> ControlFlow<()>,
    ) -> Result<(), CameraError> {
        self.stream(on_frame, on_idle)
    }
}

/// Counts consecutive stream failures and decides when to stop retrying.
#[derive(Debug)]
struct RetryBudget {
    max: u32,
    failures: u32,
}

impl RetryBudget {
    fn new(max: u32) -> Self {
        Self { max, failures: 0 }
    }

    /// Note a failure. Returns the error once the budget is spent.
    fn record(&mut self, error: &CameraError) -> Result<(), CameraError> {
        self.failures += 1;
        if self.failures > self.max {
            return Err(CameraError::CaptureFailed(format!(
                "{error} ({} consecutive failures)",
                self.failures
            )));
        }
        if self.failures == 1 || self.failures == self.max {
            tracing::warn!(
                error = %error,
                attempt = self.failures,
                max = self.max,
                "camera stream failed; retrying"
            );
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}
