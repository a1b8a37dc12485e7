//! Captured frames and reduction of raw V4L2 buffers to 8-bit luma.

use image::{DynamicImage, GrayImage};
use std::time::Instant;

/// Pixels below this level count towards darkness.
const DARK_LEVEL: u8 = 32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// One grayscale frame, `width * height` bytes row-major.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Mean luma in `0.0..=255.0`; 0 for an empty frame.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let total: u64 = self.data.iter().map(|&p| u64::from(p)).sum();
        total as f32 / self.data.len() as f32
    }

    /// Hand the buffer to the image crate without copying.
    pub fn into_image(self) -> Result<DynamicImage, FrameError> {
        let expected = self.width as usize * self.height as usize;
        let actual = self.data.len();
        GrayImage::from_raw(self.width, self.height, self.data)
            .map(DynamicImage::ImageLuma8)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// Borrow the first `width * height * bytes_per_pixel` bytes of `buf`.
fn payload(buf: &[u8], width: u32, height: u32, bytes_per_pixel: usize) -> Result<&[u8], FrameError> {
    let expected = width as usize * height as usize * bytes_per_pixel;
    buf.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })
}

/// YUYV packs two pixels in four bytes `[Y0 U Y1 V]`; keep the Y bytes.
pub fn yuyv_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    Ok(payload(buf, width, height, 2)?.iter().step_by(2).copied().collect())
}

/// Y16 is little-endian; the high byte is the 8-bit value.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    Ok(payload(buf, width, height, 2)?.chunks_exact(2).map(|px| px[1]).collect())
}

pub fn grey_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    Ok(payload(buf, width, height, 1)?.to_vec())
}

/// True when more than `max_dark_share` of the pixels are below the dark level.
/// An empty frame is dark.
pub fn is_dark_frame(gray: &[u8], max_dark_share: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_LEVEL).count();
    dark as f32 / gray.len() as f32 > max_dark_share
}
