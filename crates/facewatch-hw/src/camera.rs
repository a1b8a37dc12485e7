//! V4L2 capture through the `v4l` crate, exposed to the pipeline as a frame source.

use crate::frame::{self, Frame, FrameError};
use facewatch_core::ports::{FrameSource, PortError};
use image::DynamicImage;
use std::io;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 360;
const STREAM_BUFFERS: u32 = 4;
/// Share of sub-32 pixels above which a frame counts as dark.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
/// Highest `/dev/videoN` index scanned when listing devices.
const MAX_DEVICE_INDEX: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no such device: {0}")]
    NotFound(String),
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a video capture device")]
    NotCapture(String),
    #[error("format negotiation failed: {0}")]
    Format(String),
    #[error("capture failed: {0}")]
    Capture(#[source] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A V4L2 capture device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can deliver and we can reduce to 8-bit luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUYV 4:2:2; luma is every other byte.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Grey => frame::grey_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// An opened capture device with a negotiated format.
pub struct Camera {
    device: Device,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Camera {
    /// Open `path` (e.g. `/dev/video0`) and negotiate a grayscale-capable format.
    pub fn open(path: &str) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::NotFound(path.to_string()));
        }
        let device = Device::with_path(path).map_err(|source| CameraError::Open {
            path: path.to_string(),
            source,
        })?;

        let caps = device.query_caps().map_err(CameraError::Capture)?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture(path.to_string()));
        }

        // Monochrome sensors answer a YUYV request with GREY or Y16.
        let mut wanted = device
            .format()
            .map_err(|e| CameraError::Format(format!("query: {e}")))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = REQUEST_WIDTH;
        wanted.height = REQUEST_HEIGHT;
        let actual = device
            .set_format(&wanted)
            .map_err(|e| CameraError::Format(format!("set: {e}")))?;

        let format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
            CameraError::Format(format!("driver offered {}, need YUYV, GREY or Y16", actual.fourcc))
        })?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width = actual.width,
            height = actual.height,
            ?format,
            "camera ready"
        );

        Ok(Self {
            device,
            path: path.to_string(),
            width: actual.width,
            height: actual.height,
            format,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    /// Start a memory-mapped stream borrowing this camera.
    pub fn stream(&self) -> Result<CameraStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(CameraError::Capture)?;
        Ok(CameraStream { camera: self, stream })
    }

    /// Scan `/dev/video0..15` for capture-capable devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Frames flowing from a [`Camera`].
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl CameraStream<'_> {
    /// Block for the next buffer and reduce it to grayscale.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(CameraError::Capture)?;
        let sequence = meta.sequence;
        let cam = self.camera;
        let data = cam.format.to_grayscale(buf, cam.width, cam.height)?;
        let is_dark = frame::is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Ok(Frame {
            data,
            width: cam.width,
            height: cam.height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// Drop `count` frames so auto-exposure can settle.
    pub fn warm_up(&mut self, count: usize) -> Result<(), CameraError> {
        for _ in 0..count {
            self.capture_frame()?;
        }
        tracing::debug!(count, device = self.camera.path(), "warm-up done");
        Ok(())
    }
}

impl FrameSource for CameraStream<'_> {
    /// Dark frames come back as `None`.
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, PortError> {
        let frame = self.capture_frame().map_err(|e| PortError::new("capture", e))?;
        if frame.is_dark {
            tracing::debug!(seq = frame.sequence, brightness = frame.avg_brightness(), "dark frame");
            return Ok(None);
        }
        frame
            .into_image()
            .map(Some)
            .map_err(|e| PortError::new("capture", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_pixel_format_to_grayscale() {
        let yuyv = [10, 128, 20, 128];
        assert_eq!(PixelFormat::Yuyv.to_grayscale(&yuyv, 2, 1).unwrap(), vec![10, 20]);
        assert_eq!(PixelFormat::Grey.to_grayscale(&yuyv, 2, 2).unwrap(), yuyv.to_vec());
        assert_eq!(PixelFormat::Y16.to_grayscale(&yuyv, 2, 1).unwrap(), vec![128, 128]);
    }

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            Camera::open("/dev/facewatch-no-such-device"),
            Err(CameraError::NotFound(_))
        ));
    }
}
