//! facewatch-hw: V4L2 camera capture.
//!
//! Opens a capture device, negotiates a grayscale-friendly pixel format and
//! exposes a stream that plugs into the recognition pipeline as a frame source.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
