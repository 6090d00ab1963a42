//! Camera session manager.
//!
//! Owns exclusive access to the capture device. There is exactly one
//! physical pipeline, so at most one stream may be live at a time:
//! `start` always releases the existing source before acquiring a new
//! one, which also avoids the OS-level "camera busy" failure mode.

use crate::camera::{CameraError, DeviceProvider, FacingMode, FrameSource};
use crate::frame::Frame;

struct ActiveStream {
    source: Box<dyn FrameSource>,
    facing: FacingMode,
}

pub struct CameraSession {
    provider: Box<dyn DeviceProvider>,
    active: Option<ActiveStream>,
}

impl CameraSession {
    pub fn new(provider: Box<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            active: None,
        }
    }

    /// Acquire a stream for the given facing mode, releasing any
    /// existing stream first.
    pub fn start(&mut self, facing: FacingMode) -> Result<(), CameraError> {
        self.stop();
        let source = self.provider.acquire(facing)?;
        tracing::info!(facing = facing.as_str(), "camera session started");
        self.active = Some(ActiveStream { source, facing });
        Ok(())
    }

    /// Release the active stream. Idempotent.
    pub fn stop(&mut self) {
        if self.active.take().is_some() {
            tracing::info!("camera session stopped");
        }
    }

    /// Toggle the facing mode, reacquiring the device.
    pub fn switch(&mut self) -> Result<FacingMode, CameraError> {
        let facing = self
            .facing()
            .ok_or(CameraError::NoActiveSession)?
            .toggled();
        self.start(facing)?;
        Ok(facing)
    }

    /// Capture one frame from the active stream.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        match &mut self.active {
            Some(stream) => stream.source.grab(),
            None => Err(CameraError::NoActiveSession),
        }
    }

    pub fn is_live(&self) -> bool {
        self.active.is_some()
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.active.as_ref().map(|s| s.facing)
    }
}
