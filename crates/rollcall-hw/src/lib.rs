//! rollcall-hw — camera capture hardware abstraction.
//!
//! Provides the frame type, V4L2-backed capture devices, and the camera
//! session manager that enforces the single-active-stream invariant.

pub mod camera;
pub mod frame;
pub mod session;

pub use camera::{CameraError, DeviceProvider, FacingMode, FrameSource, V4lProvider};
pub use frame::{is_dark_frame, Frame, DARK_FRAME_RATIO};
pub use session::CameraSession;
