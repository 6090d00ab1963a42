//! Capture device contracts and the V4L2 implementation.
//!
//! The session manager talks to devices through the object-safe
//! [`DeviceProvider`] / [`FrameSource`] pair: acquiring a source claims
//! the device, dropping it releases the handle.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 1280;
const CAPTURE_HEIGHT: u32 = 720;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("no active camera session")]
    NoActiveSession,
}

/// Which camera the session should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    Front,
    Back,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::Front => FacingMode::Back,
            FacingMode::Back => FacingMode::Front,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FacingMode::Front => "front",
            FacingMode::Back => "back",
        }
    }
}

impl FromStr for FacingMode {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, CameraError> {
        match s {
            "front" | "user" => Ok(FacingMode::Front),
            "back" | "environment" => Ok(FacingMode::Back),
            other => Err(CameraError::Unavailable(format!(
                "unknown facing mode: {other}"
            ))),
        }
    }
}

/// A live capture stream. Dropping it releases the device handle.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Maps a facing mode to a capture device and acquires a stream.
pub trait DeviceProvider: Send + Sync {
    fn acquire(&self, facing: FacingMode) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Negotiated pixel format for a V4L2 device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

/// V4L2 provider mapping front/back to configured device paths. The back
/// device is optional; most laptops only have one camera.
pub struct V4lProvider {
    front_path: String,
    back_path: Option<String>,
}

impl V4lProvider {
    pub fn new(front_path: impl Into<String>, back_path: Option<String>) -> Self {
        Self {
            front_path: front_path.into(),
            back_path,
        }
    }
}

impl DeviceProvider for V4lProvider {
    fn acquire(&self, facing: FacingMode) -> Result<Box<dyn FrameSource>, CameraError> {
        let path = match facing {
            FacingMode::Front => self.front_path.as_str(),
            FacingMode::Back => self.back_path.as_deref().ok_or_else(|| {
                CameraError::Unavailable("no back camera device configured".into())
            })?,
        };
        Ok(Box::new(V4lSource::open(path)?))
    }
}

/// An opened V4L2 capture device.
pub struct V4lSource {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lSource {
    /// Open a V4L2 device by path (e.g., "/dev/video0") and negotiate a
    /// capture format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::Unavailable(format!(
                "device not found: {device_path}"
            )));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::Unavailable(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::Unavailable(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera device"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::Unavailable(format!(
                "{device_path} does not support video capture"
            )));
        }

        // Request YUYV at 1280x720; accept GREY if the driver negotiates it.
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated capture format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;
        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }
}

impl FrameSource for V4lSource {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self.buf_to_grayscale(buf)?;
        Ok(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }
}
